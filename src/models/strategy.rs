use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Long,
    Short,
    Both,
}

impl Direction {
    pub fn allows(&self, side: crate::models::order::OrderSide) -> bool {
        use crate::models::order::OrderSide::*;
        match self {
            Direction::Both => true,
            Direction::Long => matches!(side, Buy),
            Direction::Short => matches!(side, Sell),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Neq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Logic {
    And,
    Or,
    Not,
}

impl Default for Logic {
    fn default() -> Self {
        Logic::And
    }
}

/// One clause of a section's condition list: compare the latest value of
/// `indicator_id` against `value` using `operator`, then fold into the
/// section result using `logic`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub indicator_id: String,
    pub operator: Operator,
    pub value: f64,
    #[serde(default)]
    pub logic: Logic,
}

impl Condition {
    /// Evaluate against a known indicator value. NaN never matches, per
    /// §4.5: numeric comparisons use an epsilon for `==`/`!=` and NaN
    /// comparisons yield false unconditionally.
    pub fn matches(&self, current: f64, epsilon: f64) -> bool {
        if current.is_nan() {
            return false;
        }
        match self.operator {
            Operator::Lt => current < self.value,
            Operator::Lte => current <= self.value,
            Operator::Gt => current > self.value,
            Operator::Gte => current >= self.value,
            Operator::Eq => (current - self.value).abs() <= epsilon,
            Operator::Neq => (current - self.value).abs() > epsilon,
        }
    }
}

/// Linear interpolation of an order parameter between two thresholds of a
/// designated risk indicator ("risk scaling" in the glossary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskScaling {
    pub risk_indicator_id: String,
    pub low_risk_threshold: f64,
    pub high_risk_threshold: f64,
    pub low_risk_scale: f64,
    pub high_risk_scale: f64,
}

impl RiskScaling {
    /// Interpolate between `low_risk_scale` and `high_risk_scale` using the
    /// risk indicator's current value, clamped to the threshold range.
    pub fn scale_for(&self, risk_value: f64) -> f64 {
        if risk_value.is_nan() {
            return self.low_risk_scale;
        }
        let lo = self.low_risk_threshold;
        let hi = self.high_risk_threshold;
        if (hi - lo).abs() < f64::EPSILON {
            return self.low_risk_scale;
        }
        let clamped = risk_value.clamp(lo.min(hi), lo.max(hi));
        let t = (clamped - lo) / (hi - lo);
        self.low_risk_scale + t * (self.high_risk_scale - self.low_risk_scale)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingType {
    Fixed,
    PercentOfBudget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizing {
    #[serde(rename = "type")]
    pub sizing_type: SizingType,
    pub value: f64,
    #[serde(default)]
    pub risk_scaling: Option<RiskScaling>,
}

impl PositionSizing {
    /// Resolve to a notional amount given the strategy's remaining budget
    /// allocation and the latest value of the scaling risk indicator (if any).
    pub fn resolve(&self, remaining_allocation: f64, risk_value: Option<f64>) -> f64 {
        let base = match self.sizing_type {
            SizingType::Fixed => self.value,
            SizingType::PercentOfBudget => remaining_allocation * (self.value / 100.0),
        };
        match (&self.risk_scaling, risk_value) {
            (Some(scaling), Some(v)) => base * scaling.scale_for(v),
            _ => base,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAdjustedPct {
    pub value: f64,
    #[serde(default)]
    pub risk_scaling: Option<RiskScaling>,
}

impl RiskAdjustedPct {
    pub fn resolve(&self, risk_value: Option<f64>) -> f64 {
        match (&self.risk_scaling, risk_value) {
            (Some(scaling), Some(v)) => self.value * scaling.scale_for(v),
            _ => self.value,
        }
    }
}

/// Section 1: candidate detection. A match arms the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S1Signal {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Section: cancellation. Timeout and cooldown govern how long an armed
/// instance waits for entry before falling back to monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct O1Cancel {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub timeout_seconds: u64,
    pub cooldown_minutes: u64,
}

/// Section: entry conditions and order parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Z1Entry {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Indicator used as the fill reference price.
    pub price_source: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub stop_loss_pct: Option<RiskAdjustedPct>,
    #[serde(default)]
    pub take_profit_pct: Option<RiskAdjustedPct>,
    pub position_size: PositionSizing,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
}

fn default_leverage() -> f64 {
    1.0
}

/// Section: exit conditions (optional).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ze1Close {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub close_price_source: String,
    #[serde(default)]
    pub adjustment_pct: Option<RiskAdjustedPct>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmergencyActions {
    #[serde(default)]
    pub cancel_pending: bool,
    #[serde(default)]
    pub close_position: bool,
    #[serde(default)]
    pub log_event: bool,
}

/// Hard-stop section: always evaluated regardless of instance state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyExit {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub cooldown_minutes: u64,
    #[serde(default)]
    pub actions: EmergencyActions,
}

/// A user-authored strategy: five condition sections plus a direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy_id: String,
    #[serde(default = "default_direction")]
    pub direction: Direction,
    pub s1_signal: S1Signal,
    pub o1_cancel: O1Cancel,
    pub z1_entry: Z1Entry,
    #[serde(default)]
    pub ze1_close: Option<Ze1Close>,
    pub emergency_exit: EmergencyExit,
}

fn default_direction() -> Direction {
    Direction::Both
}

impl StrategyConfig {
    /// All indicator ids referenced anywhere in the strategy, used by the
    /// controller to compute the variant union handed to the indicator engine.
    pub fn referenced_indicator_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for c in &self.s1_signal.conditions {
            ids.push(c.indicator_id.clone());
        }
        for c in &self.o1_cancel.conditions {
            ids.push(c.indicator_id.clone());
        }
        for c in &self.z1_entry.conditions {
            ids.push(c.indicator_id.clone());
        }
        ids.push(self.z1_entry.price_source.clone());
        if let Some(scaling) = self.z1_entry.stop_loss_pct.as_ref().and_then(|p| p.risk_scaling.as_ref()) {
            ids.push(scaling.risk_indicator_id.clone());
        }
        if let Some(scaling) = self.z1_entry.take_profit_pct.as_ref().and_then(|p| p.risk_scaling.as_ref()) {
            ids.push(scaling.risk_indicator_id.clone());
        }
        if let Some(scaling) = self.z1_entry.position_size.risk_scaling.as_ref() {
            ids.push(scaling.risk_indicator_id.clone());
        }
        if let Some(ze1) = &self.ze1_close {
            for c in &ze1.conditions {
                ids.push(c.indicator_id.clone());
            }
            ids.push(ze1.close_price_source.clone());
            if let Some(scaling) = ze1.adjustment_pct.as_ref().and_then(|p| p.risk_scaling.as_ref()) {
                ids.push(scaling.risk_indicator_id.clone());
            }
        }
        for c in &self.emergency_exit.conditions {
            ids.push(c.indicator_id.clone());
        }
        ids.sort();
        ids.dedup();
        ids
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyState {
    Monitoring,
    S1Armed,
    Z1Pending,
    PositionActive,
    Ze1Pending,
    Cooldown,
    Error,
}

/// Runtime `(strategy_id, symbol)` object with its own state machine. Owned
/// exclusively by its subscriber coroutine in the Strategy Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyInstance {
    pub strategy_id: String,
    pub symbol: String,
    pub state: StrategyState,
    pub since: DateTime<Utc>,
    pub last_signal_id: Option<String>,
    pub open_order_id: Option<String>,
    pub open_position_id: Option<String>,
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Latest value seen per referenced indicator id; a section is only
    /// evaluated once every indicator it references has at least one value.
    #[serde(skip)]
    pub indicator_values: HashMap<String, f64>,
}

impl StrategyInstance {
    pub fn new(strategy_id: impl Into<String>, symbol: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            symbol: symbol.into(),
            state: StrategyState::Monitoring,
            since: now,
            last_signal_id: None,
            open_order_id: None,
            open_position_id: None,
            cooldown_until: None,
            indicator_values: HashMap::new(),
        }
    }

    pub fn key(&self) -> (String, String) {
        (self.strategy_id.clone(), self.symbol.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_matches_respects_epsilon() {
        let cond = Condition {
            indicator_id: "x".to_string(),
            operator: Operator::Eq,
            value: 1.0,
            logic: Logic::And,
        };
        assert!(cond.matches(1.0 + 1e-12, 1e-9));
        assert!(!cond.matches(1.1, 1e-9));
    }

    #[test]
    fn condition_nan_never_matches() {
        let cond = Condition {
            indicator_id: "x".to_string(),
            operator: Operator::Gte,
            value: 0.0,
            logic: Logic::And,
        };
        assert!(!cond.matches(f64::NAN, 1e-9));
    }

    #[test]
    fn risk_scaling_interpolates_and_clamps() {
        let scaling = RiskScaling {
            risk_indicator_id: "drawdown".to_string(),
            low_risk_threshold: 0.0,
            high_risk_threshold: 10.0,
            low_risk_scale: 1.0,
            high_risk_scale: 0.5,
        };
        assert!((scaling.scale_for(5.0) - 0.75).abs() < 1e-9);
        assert!((scaling.scale_for(-5.0) - 1.0).abs() < 1e-9);
        assert!((scaling.scale_for(50.0) - 0.5).abs() < 1e-9);
    }
}

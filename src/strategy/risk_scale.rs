//! Resolves a `z1_entry` (or `ze1_close`) section's parameters against the
//! live indicator snapshot: entry price, position notional, stop-loss and
//! take-profit offsets, each optionally risk-scaled.

use std::collections::HashMap;

use crate::models::{PositionSizing, RiskAdjustedPct, Z1Entry};

pub struct ResolvedEntry {
    pub entry_price: f64,
    pub notional: f64,
    pub stop_loss_price: Option<f64>,
    pub take_profit_price: Option<f64>,
    pub leverage: f64,
}

/// `remaining_allocation` is the strategy's unused budget at this instant —
/// the caller (order manager) is the source of truth for how much of the
/// allocation is already committed to open positions.
pub fn resolve_entry(z1: &Z1Entry, indicator_values: &HashMap<String, f64>, remaining_allocation: f64) -> Option<ResolvedEntry> {
    let entry_price = *indicator_values.get(&z1.price_source)?;
    if entry_price.is_nan() || entry_price <= 0.0 {
        return None;
    }

    let risk_value = z1
        .position_size
        .risk_scaling
        .as_ref()
        .and_then(|s| indicator_values.get(&s.risk_indicator_id).copied());
    let notional = z1.position_size.resolve(remaining_allocation, risk_value);

    let stop_loss_price = resolve_pct_offset(z1.stop_loss_pct.as_ref(), indicator_values, entry_price, -1.0);
    let take_profit_price = resolve_pct_offset(z1.take_profit_pct.as_ref(), indicator_values, entry_price, 1.0);

    Some(ResolvedEntry {
        entry_price,
        notional,
        stop_loss_price,
        take_profit_price,
        leverage: z1.leverage,
    })
}

fn resolve_pct_offset(
    pct: Option<&RiskAdjustedPct>,
    indicator_values: &HashMap<String, f64>,
    entry_price: f64,
    sign: f64,
) -> Option<f64> {
    let pct = pct?;
    let risk_value = pct
        .risk_scaling
        .as_ref()
        .and_then(|s| indicator_values.get(&s.risk_indicator_id).copied());
    let resolved_pct = pct.resolve(risk_value);
    Some(entry_price * (1.0 + sign * resolved_pct / 100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SizingType;

    #[test]
    fn resolves_fixed_size_entry_with_stop_loss() {
        let z1 = Z1Entry {
            conditions: vec![],
            price_source: "twpa_60s".to_string(),
            timeout_seconds: None,
            stop_loss_pct: Some(RiskAdjustedPct { value: 5.0, risk_scaling: None }),
            take_profit_pct: None,
            position_size: PositionSizing {
                sizing_type: SizingType::Fixed,
                value: 100.0,
                risk_scaling: None,
            },
            leverage: 1.0,
        };
        let mut values = HashMap::new();
        values.insert("twpa_60s".to_string(), 100.0);

        let resolved = resolve_entry(&z1, &values, 1000.0).unwrap();
        assert!((resolved.notional - 100.0).abs() < 1e-9);
        assert!((resolved.stop_loss_price.unwrap() - 95.0).abs() < 1e-9);
    }

    #[test]
    fn missing_price_source_yields_none() {
        let z1 = Z1Entry {
            conditions: vec![],
            price_source: "missing".to_string(),
            timeout_seconds: None,
            stop_loss_pct: None,
            take_profit_pct: None,
            position_size: PositionSizing {
                sizing_type: SizingType::Fixed,
                value: 100.0,
                risk_scaling: None,
            },
            leverage: 1.0,
        };
        assert!(resolve_entry(&z1, &HashMap::new(), 1000.0).is_none());
    }
}

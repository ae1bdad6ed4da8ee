//! Folds a section's condition list into a single boolean, using each
//! condition's own `logic` field to combine it with the ones before it.

use std::collections::HashMap;

use crate::models::{Condition, Logic};

/// `conditions[0]` seeds the accumulator; every condition after that folds
/// in with its own `logic`. An empty list never matches — a section with
/// no conditions can't fire on its own.
pub fn evaluate(conditions: &[Condition], indicator_values: &HashMap<String, f64>, epsilon: f64) -> bool {
    let mut acc: Option<bool> = None;
    for condition in conditions {
        let current = indicator_values
            .get(&condition.indicator_id)
            .copied()
            .unwrap_or(f64::NAN);
        let matched = condition.matches(current, epsilon);
        acc = Some(match acc {
            None => matched,
            Some(prev) => match condition.logic {
                Logic::And => prev && matched,
                Logic::Or => prev || matched,
                Logic::Not => prev && !matched,
            },
        });
    }
    acc.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Operator;

    fn cond(id: &str, op: Operator, value: f64, logic: Logic) -> Condition {
        Condition {
            indicator_id: id.to_string(),
            operator: op,
            value,
            logic,
        }
    }

    #[test]
    fn empty_conditions_never_match() {
        let values = HashMap::new();
        assert!(!evaluate(&[], &values, 1e-9));
    }

    #[test]
    fn and_requires_both_clauses() {
        let conditions = vec![
            cond("a", Operator::Gt, 0.0, Logic::And),
            cond("b", Operator::Gt, 0.0, Logic::And),
        ];
        let mut values = HashMap::new();
        values.insert("a".to_string(), 1.0);
        values.insert("b".to_string(), -1.0);
        assert!(!evaluate(&conditions, &values, 1e-9));
        values.insert("b".to_string(), 1.0);
        assert!(evaluate(&conditions, &values, 1e-9));
    }

    #[test]
    fn or_requires_either_clause() {
        let conditions = vec![
            cond("a", Operator::Gt, 0.0, Logic::And),
            cond("b", Operator::Gt, 0.0, Logic::Or),
        ];
        let mut values = HashMap::new();
        values.insert("a".to_string(), -1.0);
        values.insert("b".to_string(), 1.0);
        assert!(evaluate(&conditions, &values, 1e-9));
    }

    #[test]
    fn missing_indicator_value_is_treated_as_nan_and_never_matches() {
        let conditions = vec![cond("missing", Operator::Gte, 0.0, Logic::And)];
        let values = HashMap::new();
        assert!(!evaluate(&conditions, &values, 1e-9));
    }
}

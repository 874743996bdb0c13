use crate::condition::EvaluationTrace;
use crate::runtime::RunTrace;
use serde_json::Value;

/// Formats evaluation and run traces into human-readable strings
pub struct TraceFormatter;

impl TraceFormatter {
    /// Format a condition trace, annotating each state field with the value it had.
    pub fn format_trace(trace: &EvaluationTrace) -> String {
        Self::format_recursive(trace, 0)
    }

    /// Format a whole run, one line per executed routine.
    pub fn format_run(trace: &RunTrace) -> String {
        trace
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let mut line = format!("{:>3}. {} [{}] -> {}", i + 1, step.routine, step.kind, step.next);
                if let Some(note) = &step.note {
                    line.push_str(&format!(" ({})", note));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Adds parentheses only where the child binds looser than its parent.
    fn format_recursive(trace: &EvaluationTrace, parent_precedence: u8) -> String {
        let current_precedence = trace.precedence();
        let needs_parens = current_precedence < parent_precedence;

        let mut result = String::new();
        if needs_parens {
            result.push('(');
        }

        match trace {
            EvaluationTrace::BinaryOp {
                op_symbol,
                left,
                right,
                ..
            } => {
                let left_str = Self::format_recursive(left, current_precedence);

                // Short-circuited right sides are omitted.
                if !matches!(**right, EvaluationTrace::NotEvaluated) {
                    let right_str = Self::format_recursive(right, current_precedence);
                    result.push_str(&format!("{} {} {}", left_str, op_symbol, right_str));
                } else {
                    result.push_str(&left_str);
                }
            }
            EvaluationTrace::UnaryOp {
                op_symbol, child, ..
            } => {
                let child_str = Self::format_recursive(child, current_precedence);
                result.push_str(&format!("{} {}", op_symbol, child_str));
            }
            EvaluationTrace::Leaf { source, value } => {
                let formatted_leaf = match source.strip_prefix('$') {
                    Some(path) => format!("{} (was {})", path, Self::format_value(value)),
                    None => source.clone(),
                };
                result.push_str(&formatted_leaf);
            }
            EvaluationTrace::NotEvaluated => {}
        }

        if needs_parens {
            result.push(')');
        }
        result
    }

    fn format_value(value: &Value) -> String {
        match value {
            Value::Number(n) => match n.as_f64() {
                Some(f) if n.is_f64() && f.fract() == 0.0 => format!("{}", f as i64),
                _ => n.to_string(),
            },
            Value::String(s) => format!("{:?}", s),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{evaluate_condition, parse_expression};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_field_leaves_show_their_values() {
        let mut state = BTreeMap::new();
        state.insert("count".to_string(), json!(4));
        state.insert("status".to_string(), json!("done"));
        let expr = parse_expression("state.count > 2 and state.status == 'done'").expect("parses");
        let (outcome, trace) = evaluate_condition(&expr, &state).expect("evaluates");
        assert!(outcome);
        assert_eq!(
            TraceFormatter::format_trace(&trace),
            "count (was 4) > 2 and status (was \"done\") == \"done\""
        );
    }

    #[test]
    fn test_short_circuit_hides_right_side() {
        let mut state = BTreeMap::new();
        state.insert("ready".to_string(), json!(false));
        let expr = parse_expression("state.ready and state.count > 1").expect("parses");
        let (outcome, trace) = evaluate_condition(&expr, &state).expect("evaluates");
        assert!(!outcome);
        assert_eq!(TraceFormatter::format_trace(&trace), "ready (was false)");
    }
}

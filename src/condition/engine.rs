use super::value::{is_truthy, loosely_equal};
use super::{EvaluationTrace, Expression, FieldPath};
use crate::error::ExpressionError;
use serde_json::Value;
use std::collections::BTreeMap;

// This macro generates a match arm for a binary operation.
macro_rules! eval_op {
    ($self:ident, $l:ident, $r:ident, $op_str:expr, $op_fn:expr, number) => {
        $self.eval_arithmetic($l, $r, $op_str, $op_fn)
    };
    ($self:ident, $l:ident, $r:ident, $op_str:expr, $op_fn:expr, ordering) => {
        $self.eval_ordering($l, $r, $op_str, $op_fn)
    };
}

/// Evaluates a condition against shared state and returns its truthiness.
pub fn evaluate_condition(
    expression: &Expression,
    state: &BTreeMap<String, Value>,
) -> Result<(bool, EvaluationTrace), ExpressionError> {
    let trace = ConditionEngine::new(state).evaluate(expression)?;
    Ok((is_truthy(&trace.get_outcome()), trace))
}

/// The recursive engine for evaluating one expression over a state snapshot.
pub(crate) struct ConditionEngine<'a> {
    state: &'a BTreeMap<String, Value>,
}

impl<'a> ConditionEngine<'a> {
    pub(crate) fn new(state: &'a BTreeMap<String, Value>) -> Self {
        Self { state }
    }

    pub(crate) fn evaluate(&self, expr: &Expression) -> Result<EvaluationTrace, ExpressionError> {
        match expr {
            // --- Arithmetic Operations ---
            Expression::Sum(l, r) => eval_op!(self, l, r, "+", |a, b| a + b, number),
            Expression::Subtract(l, r) => eval_op!(self, l, r, "-", |a, b| a - b, number),
            Expression::Multiply(l, r) => eval_op!(self, l, r, "*", |a, b| a * b, number),
            Expression::Divide(l, r) => {
                let right_trace = self.evaluate(r)?;
                if right_trace.get_outcome().as_f64() == Some(0.0) {
                    return Err(ExpressionError::TypeMismatch {
                        operation: "/".to_string(),
                        expected: "non-zero divisor".to_string(),
                        found: right_trace.get_outcome(),
                    });
                }
                eval_op!(self, l, r, "/", |a, b| a / b, number)
            }

            // --- Comparison Operations ---
            Expression::GreaterThan(l, r) => eval_op!(self, l, r, ">", |o| o.is_gt(), ordering),
            Expression::SmallerThan(l, r) => eval_op!(self, l, r, "<", |o| o.is_lt(), ordering),
            Expression::GreaterThanOrEqual(l, r) => {
                eval_op!(self, l, r, ">=", |o| o.is_ge(), ordering)
            }
            Expression::SmallerThanOrEqual(l, r) => {
                eval_op!(self, l, r, "<=", |o| o.is_le(), ordering)
            }

            // --- Equality ---
            Expression::Equal(l, r) => {
                let left = self.evaluate(l)?;
                let right = self.evaluate(r)?;
                let outcome = Value::Bool(loosely_equal(&left.get_outcome(), &right.get_outcome()));
                Ok(binary("==", left, right, outcome))
            }
            Expression::NotEqual(l, r) => {
                let left = self.evaluate(l)?;
                let right = self.evaluate(r)?;
                let outcome =
                    Value::Bool(!loosely_equal(&left.get_outcome(), &right.get_outcome()));
                Ok(binary("!=", left, right, outcome))
            }

            // --- Logical Operations (short-circuiting) ---
            Expression::And(l, r) => {
                let left = self.evaluate(l)?;
                if !is_truthy(&left.get_outcome()) {
                    return Ok(binary("and", left, EvaluationTrace::NotEvaluated, Value::Bool(false)));
                }
                let right = self.evaluate(r)?;
                let outcome = Value::Bool(is_truthy(&right.get_outcome()));
                Ok(binary("and", left, right, outcome))
            }
            Expression::Or(l, r) => {
                let left = self.evaluate(l)?;
                if is_truthy(&left.get_outcome()) {
                    return Ok(binary("or", left, EvaluationTrace::NotEvaluated, Value::Bool(true)));
                }
                let right = self.evaluate(r)?;
                let outcome = Value::Bool(is_truthy(&right.get_outcome()));
                Ok(binary("or", left, right, outcome))
            }
            Expression::Not(v) => {
                let child = self.evaluate(v)?;
                let outcome = Value::Bool(!is_truthy(&child.get_outcome()));
                Ok(EvaluationTrace::UnaryOp {
                    op_symbol: "not",
                    child: Box::new(child),
                    outcome,
                })
            }

            // --- Collections ---
            Expression::Contains(haystack, needle) => {
                let haystack_trace = self.evaluate(haystack)?;
                let needle_trace = self.evaluate(needle)?;
                let needle_value = needle_trace.get_outcome();
                let found = match haystack_trace.get_outcome() {
                    Value::Array(items) => items.iter().any(|i| loosely_equal(i, &needle_value)),
                    Value::Object(map) => needle_value.as_str().is_some_and(|k| map.contains_key(k)),
                    Value::String(text) => match &needle_value {
                        Value::String(part) => text.contains(part.as_str()),
                        other => return Err(self.type_mismatch("in", "String", other.clone())),
                    },
                    other => return Err(self.type_mismatch("in", "List, Map or String", other)),
                };
                Ok(binary("in", needle_trace, haystack_trace, Value::Bool(found)))
            }
            Expression::Length(v) => {
                let child = self.evaluate(v)?;
                let length = match child.get_outcome() {
                    Value::Array(items) => items.len(),
                    Value::Object(map) => map.len(),
                    Value::String(text) => text.chars().count(),
                    other => return Err(self.type_mismatch("len", "List, Map or String", other)),
                };
                Ok(EvaluationTrace::UnaryOp {
                    op_symbol: "len",
                    child: Box::new(child),
                    outcome: Value::from(length),
                })
            }

            // --- Leaf Nodes ---
            Expression::Literal(literal) => Ok(EvaluationTrace::Leaf {
                source: literal.to_string(),
                value: literal.to_json(),
            }),
            Expression::Field(path) => Ok(EvaluationTrace::Leaf {
                source: format!("${}", path.segments.join(".")),
                value: self.resolve(path)?,
            }),
        }
    }

    fn resolve(&self, path: &FieldPath) -> Result<Value, ExpressionError> {
        let mut segments = path.segments.iter();
        let mut current = segments
            .next()
            .and_then(|first| self.state.get(first.as_str()));
        for segment in segments {
            current = current.and_then(|value| match value {
                Value::Object(map) => map.get(segment.as_str()),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            });
        }
        match (current, &path.default) {
            (Some(value), _) => Ok(value.clone()),
            (None, Some(default)) => Ok(default.to_json()),
            (None, None) => Err(ExpressionError::FieldNotFound(path.segments.join("."))),
        }
    }

    fn eval_arithmetic<F>(
        &self,
        l: &Expression,
        r: &Expression,
        op_symbol: &'static str,
        op: F,
    ) -> Result<EvaluationTrace, ExpressionError>
    where
        F: Fn(f64, f64) -> f64,
    {
        let left = self.evaluate(l)?;
        let right = self.evaluate(r)?;
        let outcome = match (left.get_outcome().as_f64(), right.get_outcome().as_f64()) {
            (Some(a), Some(b)) => serde_json::Number::from_f64(op(a, b))
                .map(Value::Number)
                .unwrap_or(Value::Null),
            (None, _) => return Err(self.type_mismatch(op_symbol, "Number", left.get_outcome())),
            (_, None) => return Err(self.type_mismatch(op_symbol, "Number", right.get_outcome())),
        };
        Ok(binary(op_symbol, left, right, outcome))
    }

    fn eval_ordering<F>(
        &self,
        l: &Expression,
        r: &Expression,
        op_symbol: &'static str,
        op: F,
    ) -> Result<EvaluationTrace, ExpressionError>
    where
        F: Fn(std::cmp::Ordering) -> bool,
    {
        let left = self.evaluate(l)?;
        let right = self.evaluate(r)?;
        let ordering = match (left.get_outcome(), right.get_outcome()) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(&b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                (None, _) => return Err(self.type_mismatch(op_symbol, "Number", a)),
                (_, None) => return Err(self.type_mismatch(op_symbol, "Number", b)),
            },
        };
        let outcome = Value::Bool(ordering.is_some_and(op));
        Ok(binary(op_symbol, left, right, outcome))
    }

    fn type_mismatch(&self, operation: &str, expected: &str, found: Value) -> ExpressionError {
        ExpressionError::TypeMismatch {
            operation: operation.to_string(),
            expected: expected.to_string(),
            found,
        }
    }
}

fn binary(
    op_symbol: &'static str,
    left: EvaluationTrace,
    right: EvaluationTrace,
    outcome: Value,
) -> EvaluationTrace {
    EvaluationTrace::BinaryOp {
        op_symbol,
        left: Box::new(left),
        right: Box::new(right),
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::parse_expression;
    use serde_json::json;

    fn state(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn check(source: &str, state: &BTreeMap<String, Value>) -> Result<bool, ExpressionError> {
        let expr = parse_expression(source).expect("parse");
        evaluate_condition(&expr, state).map(|(outcome, _)| outcome)
    }

    #[test]
    fn test_numeric_and_text_comparisons() {
        let s = state(&[("count", json!(4)), ("status", json!("done"))]);
        assert_eq!(check("state.count > 3", &s), Ok(true));
        assert_eq!(check("count * 2 == 8.0", &s), Ok(true));
        assert_eq!(check("state['status'] != 'done'", &s), Ok(false));
    }

    #[test]
    fn test_membership_length_and_nested_paths() {
        let s = state(&[
            ("tags", json!(["a", "b"])),
            ("plan", json!({"steps": [1, 2, 3]})),
        ]);
        assert_eq!(check("'b' in state.tags", &s), Ok(true));
        assert_eq!(check("len(state.plan.steps) >= 3", &s), Ok(true));
        assert_eq!(check("state.plan.steps[0] == 1", &s), Ok(true));
    }

    #[test]
    fn test_missing_field_is_an_error_unless_defaulted() {
        let s = state(&[]);
        assert!(matches!(
            check("state.missing == 1", &s),
            Err(ExpressionError::FieldNotFound(_))
        ));
        assert_eq!(check("state.get('missing', 2) == 2", &s), Ok(true));
    }

    #[test]
    fn test_short_circuit_skips_failing_branch() {
        let s = state(&[("ready", json!(false))]);
        assert_eq!(check("state.ready and state.missing > 1", &s), Ok(false));
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let s = state(&[("name", json!("x"))]);
        assert!(matches!(
            check("state.name > 1", &s),
            Err(ExpressionError::TypeMismatch { .. })
        ));
    }
}

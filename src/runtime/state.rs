use crate::error::RuntimeError;
use crate::program::StateSchema;
use crate::workflow::MergePolicy;
use serde_json::{Number, Value};
use std::collections::BTreeMap;

/// Updates a routine returns, in emission order.
pub type StateUpdates = Vec<(String, Value)>;

/// The single shared-state record of one run.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SharedState {
    values: BTreeMap<String, Value>,
}

impl SharedState {
    /// Seeds every schema field with its initial value.
    pub fn from_schema(schema: &StateSchema) -> Self {
        let values = schema
            .fields
            .iter()
            .map(|f| (f.name.clone(), f.descriptor.initial_value()))
            .collect();
        Self { values }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn into_values(self) -> BTreeMap<String, Value> {
        self.values
    }

    /// Reads an integer counter; absent or non-numeric fields count as zero.
    pub fn counter(&self, field: &str) -> i64 {
        self.values
            .get(field)
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .unwrap_or(0)
    }

    /// Merges updates one by one under each field's declared policy.
    /// Fields the schema does not know are overwritten.
    pub fn apply(&mut self, schema: &StateSchema, updates: StateUpdates) -> Result<(), RuntimeError> {
        for (field, update) in updates {
            let policy = schema
                .field(&field)
                .map(|f| f.descriptor.merge_policy)
                .unwrap_or_default();
            let current = self.values.remove(&field).unwrap_or(Value::Null);
            let merged = merge(&field, policy, current, update)?;
            self.values.insert(field, merged);
        }
        Ok(())
    }
}

fn merge(field: &str, policy: MergePolicy, current: Value, update: Value) -> Result<Value, RuntimeError> {
    match policy {
        MergePolicy::Overwrite => Ok(update),
        MergePolicy::Append => {
            let mut items = match current {
                Value::Array(items) => items,
                Value::Null => Vec::new(),
                other => vec![other],
            };
            match update {
                Value::Array(more) => items.extend(more),
                Value::Null => {}
                single => items.push(single),
            }
            Ok(Value::Array(items))
        }
        MergePolicy::Additive => {
            let type_error = |found: &Value| RuntimeError::StateType {
                field: field.to_string(),
                policy: policy.to_string(),
                found: value_kind(found).to_string(),
            };
            let current = match current {
                Value::Null => Value::from(0),
                Value::Number(_) => current,
                other => return Err(type_error(&other)),
            };
            let Value::Number(update) = update else {
                return Err(type_error(&update));
            };
            let Value::Number(current) = current else {
                return Err(type_error(&current));
            };
            Ok(Value::Number(add_numbers(&current, &update)))
        }
    }
}

/// Integer sums stay integers; anything else is summed as a float.
fn add_numbers(left: &Number, right: &Number) -> Number {
    if let (Some(l), Some(r)) = (left.as_i64(), right.as_i64()) {
        if let Some(sum) = l.checked_add(r) {
            return Number::from(sum);
        }
    }
    let sum = left.as_f64().unwrap_or(0.0) + right.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).unwrap_or_else(|| Number::from(0))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{FieldOrigin, StateField};
    use crate::workflow::{BaseType, TypeDescriptor};
    use serde_json::json;

    fn schema() -> StateSchema {
        let field = |name: &str, base_type, policy| StateField {
            name: name.to_string(),
            descriptor: TypeDescriptor::new(base_type, policy),
            origin: FieldOrigin::Declared,
        };
        StateSchema {
            fields: vec![
                field("count", BaseType::Integer, MergePolicy::Additive),
                field("log", BaseType::Messages, MergePolicy::Append),
                field("answer", BaseType::Text, MergePolicy::Overwrite),
            ],
        }
    }

    #[test]
    fn test_merge_policies() {
        let schema = schema();
        let mut state = SharedState::from_schema(&schema);
        state
            .apply(
                &schema,
                vec![
                    ("count".to_string(), json!(1)),
                    ("count".to_string(), json!(2)),
                    ("log".to_string(), json!(["a"])),
                    ("log".to_string(), json!(["b", "c"])),
                    ("answer".to_string(), json!("first")),
                    ("answer".to_string(), json!("second")),
                ],
            )
            .expect("updates merge");
        assert_eq!(state.get("count"), Some(&json!(3)));
        assert_eq!(state.get("log"), Some(&json!(["a", "b", "c"])));
        assert_eq!(state.get("answer"), Some(&json!("second")));
    }

    #[test]
    fn test_additive_rejects_text() {
        let schema = schema();
        let mut state = SharedState::from_schema(&schema);
        let err = state
            .apply(&schema, vec![("count".to_string(), json!("three"))])
            .unwrap_err();
        assert!(matches!(err, RuntimeError::StateType { ref field, .. } if field == "count"));
    }

    #[test]
    fn test_float_addition() {
        let schema = schema();
        let mut state = SharedState::from_schema(&schema);
        state
            .apply(&schema, vec![("count".to_string(), json!(0.5))])
            .expect("float merges");
        assert_eq!(state.get("count"), Some(&json!(0.5)));
    }
}

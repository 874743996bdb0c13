use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Default cap on tool round-trips for a tool-bound node.
pub const DEFAULT_MAX_ITERATIONS: u32 = 30;

/// Default text injected when a node approaches its iteration cap.
pub const DEFAULT_ITERATION_WARNING: &str =
    "You are close to the tool iteration limit. Wrap up soon without more tool calls.";

/// How successive writes to one state field are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    /// The latest write wins.
    #[default]
    Overwrite,
    /// Lists are concatenated in emission order.
    Append,
    /// Numbers are summed.
    Additive,
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicy::Overwrite => write!(f, "overwrite"),
            MergePolicy::Append => write!(f, "append"),
            MergePolicy::Additive => write!(f, "additive"),
        }
    }
}

/// The value shape of a state or output field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseType {
    Integer,
    Float,
    Boolean,
    Text,
    List(Box<BaseType>),
    Map,
    Messages,
    Any,
    /// A type name we do not model; kept verbatim for rendering.
    Opaque(String),
}

impl BaseType {
    /// Parses an author-facing type name such as `int`, `List[str]` or `dict`.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        let lower = trimmed.to_ascii_lowercase();
        if let Some(inner) = strip_generic(&lower, &["list", "sequence", "typing.list"]) {
            let inner = inner.trim();
            if inner.is_empty() {
                return BaseType::List(Box::new(BaseType::Any));
            }
            if is_message_type(inner) {
                return BaseType::Messages;
            }
            return BaseType::List(Box::new(BaseType::parse(inner)));
        }
        if strip_generic(&lower, &["dict", "mapping", "typing.dict"]).is_some() {
            return BaseType::Map;
        }
        match lower.as_str() {
            "int" | "integer" => BaseType::Integer,
            "float" | "number" | "double" => BaseType::Float,
            "bool" | "boolean" => BaseType::Boolean,
            "str" | "string" | "text" => BaseType::Text,
            "list" | "array" => BaseType::List(Box::new(BaseType::Any)),
            "dict" | "object" | "map" => BaseType::Map,
            "messages" => BaseType::Messages,
            "any" | "typing.any" | "" => BaseType::Any,
            _ => BaseType::Opaque(trimmed.to_string()),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, BaseType::Integer | BaseType::Float)
    }

    pub fn is_sequence(&self) -> bool {
        matches!(self, BaseType::List(_) | BaseType::Messages)
    }

    /// The value a field of this type holds before anything writes to it.
    pub fn default_value(&self) -> Value {
        match self {
            BaseType::Integer => Value::from(0),
            BaseType::Float => Value::from(0.0),
            BaseType::Boolean => Value::Bool(false),
            BaseType::Text => Value::String(String::new()),
            BaseType::List(_) | BaseType::Messages => Value::Array(Vec::new()),
            BaseType::Map => Value::Object(serde_json::Map::new()),
            BaseType::Any | BaseType::Opaque(_) => Value::Null,
        }
    }
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseType::Integer => write!(f, "int"),
            BaseType::Float => write!(f, "float"),
            BaseType::Boolean => write!(f, "bool"),
            BaseType::Text => write!(f, "str"),
            BaseType::List(inner) => write!(f, "list[{}]", inner),
            BaseType::Map => write!(f, "dict"),
            BaseType::Messages => write!(f, "messages"),
            BaseType::Any => write!(f, "any"),
            BaseType::Opaque(name) => write!(f, "{}", name),
        }
    }
}

/// Type plus merge policy of one shared-state field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub base_type: BaseType,
    pub optional: bool,
    pub merge_policy: MergePolicy,
}

impl TypeDescriptor {
    pub fn new(base_type: BaseType, merge_policy: MergePolicy) -> Self {
        Self {
            base_type,
            optional: false,
            merge_policy,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Parses a declared type such as `Annotated[int, operator.add]` or `Optional[str]`,
    /// inferring the merge policy from the annotation.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        let lower = trimmed.to_ascii_lowercase();

        if let Some(inner) = strip_generic(&lower, &["annotated", "typing.annotated"]) {
            let mut parts = split_top_level(inner).into_iter();
            let base_text = parts.next().unwrap_or_default();
            let annotation = parts.collect::<Vec<_>>().join(",");
            let mut descriptor = Self::parse(&base_text);
            if is_concatenation(&annotation) {
                descriptor.merge_policy = if descriptor.base_type.is_sequence() {
                    MergePolicy::Append
                } else if descriptor.base_type.is_numeric() {
                    MergePolicy::Additive
                } else {
                    MergePolicy::Overwrite
                };
            }
            return descriptor;
        }

        if let Some(inner) = strip_generic(&lower, &["optional", "typing.optional"]) {
            return Self::parse(inner).optional();
        }

        Self::new(BaseType::parse(trimmed), MergePolicy::Overwrite)
    }

    /// The value a field holds before anything writes to it.
    pub fn initial_value(&self) -> Value {
        if self.optional {
            Value::Null
        } else {
            self.base_type.default_value()
        }
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.optional {
            write!(f, "optional[{}]", self.base_type)?;
        } else {
            write!(f, "{}", self.base_type)?;
        }
        write!(f, " ({})", self.merge_policy)
    }
}

/// Bounded-loop policy attached to every tool-bound node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IterationPolicy {
    pub max_iterations: u32,
    pub warning_message: String,
}

impl IterationPolicy {
    /// Number of remaining round-trips at which the warning turn is injected.
    pub const WARNING_WINDOW: u32 = 3;

    /// Returns the single iteration count at which the warning turn belongs.
    ///
    /// Counters grow by exactly one per round-trip, so each value is observed once per episode.
    /// The result is always below the cap; with a cap of one the warning rides on the first call.
    pub fn warning_iteration(&self) -> u32 {
        self.max_iterations
            .saturating_sub(Self::WARNING_WINDOW)
            .max(1)
            .min(self.max_iterations.saturating_sub(1))
    }
}

impl Default for IterationPolicy {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            warning_message: DEFAULT_ITERATION_WARNING.to_string(),
        }
    }
}

/// One declared field of a structured output schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    pub base_type: BaseType,
    pub description: String,
}

/// Strips `name[...]` for any of the given generic names, returning the bracket contents.
fn strip_generic<'a>(lower: &'a str, names: &[&str]) -> Option<&'a str> {
    names.iter().find_map(|name| {
        lower
            .strip_prefix(name)
            .and_then(|rest| rest.trim_start().strip_prefix('['))
            .and_then(|rest| rest.strip_suffix(']'))
    })
}

/// Splits on commas that are not nested inside brackets.
fn split_top_level(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '[' | '(' => {
                depth += 1;
                current.push(c);
            }
            ']' | ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

fn is_message_type(inner: &str) -> bool {
    matches!(
        inner,
        "basemessage" | "anymessage" | "message" | "messages"
    )
}

fn is_concatenation(annotation: &str) -> bool {
    let compact: String = annotation.chars().filter(|c| !c.is_whitespace()).collect();
    compact.contains("operator.add") || compact.contains("x+y") || compact == "add"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_types() {
        assert_eq!(BaseType::parse("int"), BaseType::Integer);
        assert_eq!(BaseType::parse("str"), BaseType::Text);
        assert_eq!(
            BaseType::parse("List[str]"),
            BaseType::List(Box::new(BaseType::Text))
        );
        assert_eq!(BaseType::parse("Dict[str, int]"), BaseType::Map);
        assert_eq!(BaseType::parse("List[BaseMessage]"), BaseType::Messages);
    }

    #[test]
    fn test_annotated_types_infer_merge_policy() {
        let counter = TypeDescriptor::parse("Annotated[int, operator.add]");
        assert_eq!(counter.base_type, BaseType::Integer);
        assert_eq!(counter.merge_policy, MergePolicy::Additive);

        let log = TypeDescriptor::parse("Annotated[List[BaseMessage], lambda x, y: x + y]");
        assert_eq!(log.base_type, BaseType::Messages);
        assert_eq!(log.merge_policy, MergePolicy::Append);

        let plain = TypeDescriptor::parse("Optional[str]");
        assert!(plain.optional);
        assert_eq!(plain.merge_policy, MergePolicy::Overwrite);
        assert_eq!(plain.initial_value(), Value::Null);
    }

    #[test]
    fn test_warning_iteration_is_inside_window() {
        let policy = |max| IterationPolicy {
            max_iterations: max,
            warning_message: String::new(),
        };
        assert_eq!(policy(30).warning_iteration(), 27);
        assert_eq!(policy(3).warning_iteration(), 1);
        assert_eq!(policy(2).warning_iteration(), 1);
        assert_eq!(policy(1).warning_iteration(), 0);
    }
}

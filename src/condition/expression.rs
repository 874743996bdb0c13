use super::Literal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A path into shared state, e.g. `state.plan.steps` or `state.get("done", false)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldPath {
    pub segments: Vec<String>,
    pub default: Option<Literal>,
}

impl FieldPath {
    pub fn new(segments: Vec<String>) -> Self {
        Self {
            segments,
            default: None,
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "state")?;
        for segment in &self.segments {
            write!(f, ".{}", segment)?;
        }
        if let Some(default) = &self.default {
            write!(f, " ?? {}", default)?;
        }
        Ok(())
    }
}

/// The syntax tree of a condition over shared state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expression {
    // Arithmetic
    Sum(Box<Expression>, Box<Expression>),
    Subtract(Box<Expression>, Box<Expression>),
    Multiply(Box<Expression>, Box<Expression>),
    Divide(Box<Expression>, Box<Expression>),

    // Logical
    Not(Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),

    // Comparison
    Equal(Box<Expression>, Box<Expression>),
    NotEqual(Box<Expression>, Box<Expression>),
    GreaterThan(Box<Expression>, Box<Expression>),
    GreaterThanOrEqual(Box<Expression>, Box<Expression>),
    SmallerThan(Box<Expression>, Box<Expression>),
    SmallerThanOrEqual(Box<Expression>, Box<Expression>),

    // Collections: `Contains(haystack, needle)` is written `needle in haystack`.
    Contains(Box<Expression>, Box<Expression>),
    Length(Box<Expression>),

    // Leaf nodes
    Literal(Literal),
    Field(FieldPath),
}

impl Expression {
    /// Collects the top-level state fields the expression reads.
    pub fn referenced_fields(&self, fields: &mut Vec<String>) {
        match self {
            Expression::Field(path) => {
                if let Some(first) = path.segments.first() {
                    if !fields.contains(first) {
                        fields.push(first.clone());
                    }
                }
            }
            Expression::Sum(l, r)
            | Expression::Subtract(l, r)
            | Expression::Multiply(l, r)
            | Expression::Divide(l, r)
            | Expression::And(l, r)
            | Expression::Or(l, r)
            | Expression::Equal(l, r)
            | Expression::NotEqual(l, r)
            | Expression::GreaterThan(l, r)
            | Expression::GreaterThanOrEqual(l, r)
            | Expression::SmallerThan(l, r)
            | Expression::SmallerThanOrEqual(l, r)
            | Expression::Contains(l, r) => {
                l.referenced_fields(fields);
                r.referenced_fields(fields);
            }
            Expression::Not(v) | Expression::Length(v) => v.referenced_fields(fields),
            Expression::Literal(_) => {}
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expression::Or(..) => 1,
            Expression::And(..) => 2,
            Expression::Not(..) => 3,
            Expression::Equal(..)
            | Expression::NotEqual(..)
            | Expression::GreaterThan(..)
            | Expression::GreaterThanOrEqual(..)
            | Expression::SmallerThan(..)
            | Expression::SmallerThanOrEqual(..)
            | Expression::Contains(..) => 4,
            Expression::Sum(..) | Expression::Subtract(..) => 5,
            Expression::Multiply(..) | Expression::Divide(..) => 6,
            Expression::Length(..) | Expression::Literal(..) | Expression::Field(..) => 9,
        }
    }

    fn fmt_child(&self, child: &Expression, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if child.precedence() < self.precedence() {
            write!(f, "({})", child)
        } else {
            write!(f, "{}", child)
        }
    }

    fn fmt_binary(
        &self,
        f: &mut fmt::Formatter<'_>,
        op: &str,
        l: &Expression,
        r: &Expression,
    ) -> fmt::Result {
        self.fmt_child(l, f)?;
        write!(f, " {} ", op)?;
        self.fmt_child(r, f)
    }
}

/// Renders the expression back into the condition syntax, adding parentheses only when needed.
impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Sum(l, r) => self.fmt_binary(f, "+", l, r),
            Expression::Subtract(l, r) => self.fmt_binary(f, "-", l, r),
            Expression::Multiply(l, r) => self.fmt_binary(f, "*", l, r),
            Expression::Divide(l, r) => self.fmt_binary(f, "/", l, r),
            Expression::And(l, r) => self.fmt_binary(f, "and", l, r),
            Expression::Or(l, r) => self.fmt_binary(f, "or", l, r),
            Expression::Equal(l, r) => self.fmt_binary(f, "==", l, r),
            Expression::NotEqual(l, r) => self.fmt_binary(f, "!=", l, r),
            Expression::GreaterThan(l, r) => self.fmt_binary(f, ">", l, r),
            Expression::GreaterThanOrEqual(l, r) => self.fmt_binary(f, ">=", l, r),
            Expression::SmallerThan(l, r) => self.fmt_binary(f, "<", l, r),
            Expression::SmallerThanOrEqual(l, r) => self.fmt_binary(f, "<=", l, r),
            Expression::Contains(haystack, needle) => self.fmt_binary(f, "in", needle, haystack),
            Expression::Not(v) => {
                write!(f, "not ")?;
                self.fmt_child(v, f)
            }
            Expression::Length(v) => write!(f, "len({})", v),
            Expression::Literal(v) => write!(f, "{}", v),
            Expression::Field(path) => write!(f, "{}", path),
        }
    }
}

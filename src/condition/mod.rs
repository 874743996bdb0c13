//! The condition language used by expression-mode conditional blocks.
pub mod engine;
pub mod expression;
pub mod parser;
pub mod trace;
pub mod value;

pub use engine::evaluate_condition;
pub use expression::*;
pub use parser::parse_expression;
pub use trace::*;
pub use value::*;

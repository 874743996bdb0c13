//! The JSON graph document produced by the visual editor.
mod document;
pub mod types;

pub use types::*;

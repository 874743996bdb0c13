pub mod artifact;
pub mod conversion;
pub mod definition;
pub mod types;

pub use artifact::*;
pub use conversion::*;
pub use definition::*;
pub use types::*;

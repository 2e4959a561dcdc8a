//! Pure record policies. Nothing here performs I/O.

pub mod completion;
pub mod merge;

pub use completion::{is_complete, missing_fields};
pub use merge::merge;

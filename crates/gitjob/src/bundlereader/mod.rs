//! Reads a checked-out tree into bundle content.

pub mod content;
pub mod ignore;

pub use content::load_content;
pub use ignore::{IgnoreRuleSet, IGNORE_FILE};

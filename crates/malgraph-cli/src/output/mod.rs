//! Output formatters for analysis outcomes

pub mod json;
pub mod pretty;

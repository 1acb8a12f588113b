//! Run summaries.

mod generator;

pub use generator::{generate_json_summary, generate_text_summary, write_json_summary};

//! Outcome reporting
//!
//! - `text`: console summary printed when the job ends
//! - `json`: machine-readable report written with `--json-output`

pub mod json;
pub mod text;

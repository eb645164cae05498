//! Core domain types for rpwatch.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rpwatch-core";

/// Placeholder stored for any field the extractor could not populate.
///
/// Every column in the trials table is text, so downstream code never has to
/// deal with NULLs: a field is either a real value or this literal.
pub const NOT_AVAILABLE: &str = "Not available";

/// Flat normalized record for one clinical trial, keyed by its registry
/// identifier (NCTId). All fields are always populated, with
/// [`NOT_AVAILABLE`] standing in for anything the source document lacked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub id: String,
    pub title: String,
    pub authors: String,
    pub organization: String,
    pub summary: String,
    pub start_date: String,
    pub primary_completion_date: String,
    pub end_date: String,
}

/// Sentinel substitution, composed at the extraction call site.
pub fn or_sentinel(value: Option<String>) -> String {
    value.unwrap_or_else(|| NOT_AVAILABLE.to_string())
}

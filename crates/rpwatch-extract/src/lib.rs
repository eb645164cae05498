//! Tolerant metadata extraction from raw full-studies registry documents.

use std::collections::HashSet;

use rpwatch_core::{or_sentinel, TrialRecord};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "rpwatch-extract";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed registry response: {0}")]
    Envelope(&'static str),
    #[error("invalid registry JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Parse the raw full-studies response body into the inner study documents.
///
/// The envelope is `FullStudiesResponse.FullStudies[].Study`; anything else
/// is a malformed response and surfaces as an error rather than an empty
/// study list.
pub fn parse_studies(raw: &str) -> Result<Vec<JsonValue>, ParseError> {
    let root: JsonValue = serde_json::from_str(raw)?;
    let entries = root
        .get("FullStudiesResponse")
        .and_then(|v| v.get("FullStudies"))
        .and_then(JsonValue::as_array)
        .ok_or(ParseError::Envelope(
            "missing FullStudiesResponse.FullStudies array",
        ))?;
    Ok(entries
        .iter()
        .filter_map(|entry| entry.get("Study").cloned())
        .collect())
}

/// Registry identifier of one study document, when present.
pub fn study_id(study: &JsonValue) -> Option<&str> {
    json_str(
        study,
        &["ProtocolSection", "IdentificationModule", "NCTId"],
    )
}

/// Identifiers of every study in the collection, in document order.
/// Studies without an identifier are skipped.
pub fn study_ids(studies: &[JsonValue]) -> Vec<String> {
    studies
        .iter()
        .filter_map(|study| study_id(study).map(ToString::to_string))
        .collect()
}

/// Normalize a registry date string of variable completeness.
///
/// Positional heuristic, not a calendar parser: fewer than five digit
/// characters means the day component is missing, so the literal token
/// `" 1"` is spliced in five characters from the end, keeping the trailing
/// year intact (`"March 2020"` -> `"March 1 2020"`). Full dates just lose
/// their comma separators (`"March 5, 2020"` -> `"March 5 2020"`). Inputs
/// that do not look like `"<Month> <Day,> <Year>"` go through the same
/// splice untouched by any validation.
pub fn normalize_date(raw: &str) -> String {
    let digits = raw.chars().filter(|c| c.is_ascii_digit()).count();
    if digits < 5 {
        let split = raw
            .char_indices()
            .rev()
            .nth(4)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        format!("{} 1{}", &raw[..split], &raw[split..])
    } else {
        raw.replace(',', "")
    }
}

/// Collect every string value reachable at any depth whose key contains the
/// substring `"Name"` (case-sensitive).
///
/// Depth-first, object keys in encounter order, array elements in order.
/// Contact and location metadata nests personnel names under inconsistent
/// key names (`InvestigatorName`, `LocationContactName`, plain `Name`), so
/// this trades schema awareness for robustness against drift. Non-string
/// values under a matching key are not collected but are still descended
/// into. Duplicates are dropped, keeping first-seen order.
pub fn collect_names(value: &JsonValue) -> Vec<String> {
    let mut found = Vec::new();
    let mut seen = HashSet::new();
    walk_names(value, &mut found, &mut seen);
    found
}

fn walk_names(value: &JsonValue, found: &mut Vec<String>, seen: &mut HashSet<String>) {
    match value {
        JsonValue::Object(map) => {
            for (key, child) in map {
                if key.contains("Name") {
                    if let JsonValue::String(name) = child {
                        if seen.insert(name.clone()) {
                            found.push(name.clone());
                        }
                    }
                }
                walk_names(child, found, seen);
            }
        }
        JsonValue::Array(items) => {
            for item in items {
                walk_names(item, found, seen);
            }
        }
        _ => {}
    }
}

/// Comma-joined collected names, or `None` when the subtree holds no
/// name-like field at all.
pub fn joined_names(value: &JsonValue) -> Option<String> {
    let names = collect_names(value);
    if names.is_empty() {
        None
    } else {
        Some(names.join(","))
    }
}

/// Collapse internal whitespace runs (including newlines) to single spaces.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract the flat record for `target` from the fetched study collection.
///
/// Linear scan for the first study whose identifier matches; a target absent
/// from the collection yields `None`, never an error. Every derived field is
/// pulled independently, so one missing optional section (a study with no
/// `DescriptionModule`, say) still produces a complete record with the
/// sentinel in that slot.
pub fn extract_record(studies: &[JsonValue], target: &str) -> Option<TrialRecord> {
    let study = studies.iter().find(|study| study_id(study) == Some(target))?;

    let title = json_str(
        study,
        &["ProtocolSection", "IdentificationModule", "OfficialTitle"],
    )
    .or_else(|| {
        json_str(
            study,
            &["ProtocolSection", "IdentificationModule", "BriefTitle"],
        )
    })
    .map(ToString::to_string);

    let organization = json_str(
        study,
        &[
            "ProtocolSection",
            "IdentificationModule",
            "Organization",
            "OrgFullName",
        ],
    )
    .map(ToString::to_string);

    let summary = json_str(
        study,
        &["ProtocolSection", "DescriptionModule", "BriefSummary"],
    )
    .map(collapse_whitespace);

    let authors = study
        .get("ProtocolSection")
        .and_then(|section| section.get("ContactsLocationsModule"))
        .and_then(joined_names);

    let start_date = json_str(
        study,
        &["ProtocolSection", "StatusModule", "StartDateStruct", "StartDate"],
    )
    .map(normalize_date);

    let primary_completion_date = json_str(
        study,
        &[
            "ProtocolSection",
            "StatusModule",
            "PrimaryCompletionDateStruct",
            "PrimaryCompletionDate",
        ],
    )
    .map(normalize_date);

    let end_date = json_str(
        study,
        &[
            "ProtocolSection",
            "StatusModule",
            "CompletionDateStruct",
            "CompletionDate",
        ],
    )
    .map(normalize_date);

    Some(TrialRecord {
        id: target.to_string(),
        title: or_sentinel(title),
        authors: or_sentinel(authors),
        organization: or_sentinel(organization),
        summary: or_sentinel(summary),
        start_date: or_sentinel(start_date),
        primary_completion_date: or_sentinel(primary_completion_date),
        end_date: or_sentinel(end_date),
    })
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

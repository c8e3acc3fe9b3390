//! Test fixtures.

use recall_core::Metadata;
use serde_json::Value;

/// Build a metadata document from a JSON object literal.
#[allow(dead_code)]
pub fn doc(value: Value) -> Metadata {
    Metadata::try_from(value).expect("fixture must be a JSON object")
}

/// Unique session identifier for a test.
#[allow(dead_code)]
pub fn session_id(name: &str) -> String {
    format!("{name}-{}", uuid::Uuid::new_v4())
}

//! Core data models shared across ingestion, query, alignment, and the
//! sidecar's JSON responses.

use serde::Serialize;

/// Document role in the corpus, as persisted in `documents.doc_role`.
pub const DOC_ROLE_VALUES: &[&str] =
    &["original", "translation", "excerpt", "standalone", "unknown"];

/// Relation kinds allowed in `doc_relations.relation_type` (see DESIGN.md OQ-1).
pub const RELATION_TYPES: &[&str] = &["translation_of", "excerpt_of"];

#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub doc_id: i64,
    pub title: String,
    pub language: String,
    pub doc_role: Option<String>,
    pub resource_type: Option<String>,
    pub metadata_json: Option<String>,
    pub source_hash: Option<String>,
    pub source_path: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    Line,
    Structure,
}

impl UnitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitType::Line => "line",
            UnitType::Structure => "structure",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Unit {
    pub unit_id: i64,
    pub doc_id: i64,
    pub unit_type: String,
    pub n: i64,
    pub external_id: Option<i64>,
    pub text_raw: String,
    pub text_norm: String,
    pub meta_json: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlignmentLink {
    pub link_id: i64,
    pub run_id: String,
    pub pivot_unit_id: i64,
    pub target_unit_id: i64,
    pub external_id: Option<i64>,
    pub pivot_doc_id: i64,
    pub target_doc_id: i64,
    pub created_at: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocRelation {
    pub relation_id: i64,
    pub doc_id: i64,
    pub relation_type: String,
    pub target_doc_id: i64,
    pub note: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub run_id: String,
    pub kind: String,
    pub params_json: String,
    pub stats_json: Option<String>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_type_round_trips_through_as_str() {
        assert_eq!(UnitType::Line.as_str(), "line");
        assert_eq!(UnitType::Structure.as_str(), "structure");
    }

    #[test]
    fn doc_role_values_cover_the_validated_set() {
        assert_eq!(
            DOC_ROLE_VALUES,
            &["original", "translation", "excerpt", "standalone", "unknown"]
        );
    }

    #[test]
    fn relation_types_is_closed_to_two_kinds() {
        assert_eq!(RELATION_TYPES, &["translation_of", "excerpt_of"]);
    }
}

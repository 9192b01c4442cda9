use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::query::QueryResult;

/// Current on-disk schema version written by this build.
pub const SCHEMA_VERSION: u32 = 1;

/// Kind of a cell. Kinds written by a newer build are kept verbatim.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CellKind {
    /// Fact/rule block included in every query's program text.
    Background,
    /// Record of a past execution.
    Query,
    Note,
    Other(String),
}

impl CellKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Background => "background",
            Self::Query => "query",
            Self::Note => "note",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for CellKind {
    fn from(s: &str) -> Self {
        match s {
            "background" => Self::Background,
            "query" => Self::Query,
            "note" => Self::Note,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for CellKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CellKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CellKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(CellKind::from(s.as_str()))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub kind: CellKind,
    #[serde(default)]
    pub name: String,
    pub position: u32,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub persisted: bool,
    /// Last result for query cells, kept as raw JSON so results written by
    /// a newer build still load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Cell {
    pub fn is_background(&self) -> bool {
        self.kind == CellKind::Background
    }

    /// Typed view of `result`, when it is a shape this build understands.
    pub fn query_result(&self) -> Option<QueryResult> {
        self.result
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// A named, ordered collection of cells; the unit of persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeDocument {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub cells: Vec<Cell>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl KnowledgeDocument {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            name: name.into(),
            created_at: now,
            updated_at: now,
            cells: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Append a cell at the end of the document.
    ///
    /// Positions are strictly increasing in insertion order; cell names are
    /// `<kind>_<n>` with `n` counting cells of that kind.
    pub fn push_cell(
        &mut self,
        kind: CellKind,
        content: impl Into<String>,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> &Cell {
        let position = self
            .cells
            .iter()
            .map(|c| c.position + 1)
            .max()
            .unwrap_or(0);
        let ordinal = self.cells.iter().filter(|c| c.kind == kind).count() + 1;
        let name = format!("{}_{}", kind.as_str(), ordinal);
        self.cells.push(Cell {
            kind,
            name,
            position,
            content: content.into(),
            created_at: now,
            persisted: true,
            result,
            extra: BTreeMap::new(),
        });
        self.updated_at = now;
        let idx = self.cells.len() - 1;
        &self.cells[idx]
    }

    pub fn background_cells(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter().filter(|c| c.is_background())
    }

    /// Program text for queries against this document: every background
    /// cell, in insertion order, untruncated.
    pub fn program_text(&self) -> String {
        self.background_cells()
            .map(|c| c.content.trim_end())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn summary(&self) -> DocumentSummary {
        DocumentSummary {
            name: self.name.clone(),
            cell_count: self.cells.len(),
            background_count: self.background_cells().count(),
            query_count: self
                .cells
                .iter()
                .filter(|c| c.kind == CellKind::Query)
                .count(),
            updated_at: self.updated_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub name: String,
    pub cell_count: usize,
    pub background_count: usize,
    pub query_count: usize,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family() -> KnowledgeDocument {
        let now = Utc::now();
        let mut doc = KnowledgeDocument::new("family", now);
        doc.push_cell(CellKind::Background, "parent(tom,bob).", None, now);
        doc.push_cell(CellKind::Background, "parent(bob,ann).", None, now);
        doc
    }

    #[test]
    fn program_text_joins_background_in_order() {
        let doc = family();
        assert_eq!(doc.program_text(), "parent(tom,bob).\n\nparent(bob,ann).");
    }

    #[test]
    fn query_and_note_cells_excluded_from_program() {
        let now = Utc::now();
        let mut doc = family();
        doc.push_cell(CellKind::Note, "# Family", None, now);
        doc.push_cell(
            CellKind::Query,
            "parent(tom,X)",
            Some(serde_json::json!({"status": "failure"})),
            now,
        );
        doc.push_cell(CellKind::Other("html".into()), "<b>x</b>", None, now);
        assert_eq!(doc.program_text(), "parent(tom,bob).\n\nparent(bob,ann).");
        assert_eq!(doc.cells[3].query_result(), Some(QueryResult::Failure));
    }

    #[test]
    fn empty_document_has_empty_program() {
        let doc = KnowledgeDocument::new("empty", Utc::now());
        assert_eq!(doc.program_text(), "");
    }

    #[test]
    fn positions_and_names_follow_insertion() {
        let now = Utc::now();
        let mut doc = family();
        doc.push_cell(CellKind::Query, "parent(X,Y)", None, now);
        doc.push_cell(CellKind::Background, "parent(ann,joe).", None, now);
        let positions: Vec<u32> = doc.cells.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3]);
        assert_eq!(doc.cells[3].name, "background_3");
        assert_eq!(doc.cells[2].name, "query_1");
    }

    #[test]
    fn hundreds_of_cells_are_not_truncated() {
        let now = Utc::now();
        let mut doc = KnowledgeDocument::new("big", now);
        for i in 0..500 {
            doc.push_cell(CellKind::Background, format!("n({i})."), None, now);
        }
        let program = doc.program_text();
        assert!(program.starts_with("n(0)."));
        assert!(program.ends_with("n(499)."));
        assert_eq!(program.matches("n(").count(), 500);
    }

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let raw = serde_json::json!({
            "schemaVersion": 2,
            "name": "future",
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-01T00:00:00Z",
            "owner": "someone",
            "cells": [
                {"kind": "background", "position": 0, "content": "a.", "tags": ["x"]},
                {"kind": "diagram", "position": 1, "content": "..."}
            ]
        });
        let doc: KnowledgeDocument = serde_json::from_value(raw).unwrap();
        assert_eq!(doc.extra["owner"], "someone");
        assert_eq!(doc.cells[0].extra["tags"][0], "x");
        assert_eq!(doc.cells[1].kind, CellKind::Other("diagram".into()));
        assert_eq!(doc.program_text(), "a.");

        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["owner"], "someone");
        assert_eq!(back["cells"][1]["kind"], "diagram");
        assert_eq!(back["cells"][0]["tags"][0], "x");
    }

    #[test]
    fn summary_counts_kinds() {
        let now = Utc::now();
        let mut doc = family();
        doc.push_cell(CellKind::Query, "parent(tom,X)", None, now);
        let s = doc.summary();
        assert_eq!(s.cell_count, 3);
        assert_eq!(s.background_count, 2);
        assert_eq!(s.query_count, 1);
    }
}

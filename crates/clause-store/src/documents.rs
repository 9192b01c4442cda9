use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use clause_core::document::{Cell, CellKind, DocumentSummary, KnowledgeDocument};
use clause_core::ids::validate_document_name;
use clause_core::query::QueryResult;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::atomic::{is_temp_file, sweep_temp_files, write_atomic};
use crate::error::StoreError;
use crate::notebook::render_swinb;

const DOC_EXT: &str = ".json";
const NOTEBOOK_EXT: &str = ".swinb";

/// Optional metadata given at creation time.
#[derive(Clone, Debug, Default)]
pub struct NewDocument {
    pub title: Option<String>,
    pub description: Option<String>,
    pub background: Vec<String>,
}

/// Where a notebook export was written.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedNotebook {
    pub path: PathBuf,
    pub content: String,
}

/// File-backed knowledge documents, one JSON file per document.
///
/// Mutations of one document are serialized through a per-name lock and
/// land via atomic replace, so readers (which never lock) always see a
/// complete before- or after-state.
pub struct DocumentStore {
    knowledge_dir: PathBuf,
    notebooks_dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DocumentStore {
    /// Open (creating if needed) the store under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let knowledge_dir = data_dir.join("knowledge");
        let notebooks_dir = data_dir.join("notebooks");
        for dir in [&knowledge_dir, &notebooks_dir] {
            std::fs::create_dir_all(dir).map_err(|e| StoreError::write("<store>", e))?;
        }
        let swept = sweep_temp_files(&knowledge_dir);
        if swept > 0 {
            info!(swept, dir = %knowledge_dir.display(), "discarded interrupted writes");
        }
        Ok(Self {
            knowledge_dir,
            notebooks_dir,
            locks: DashMap::new(),
        })
    }

    pub fn knowledge_dir(&self) -> &Path {
        &self.knowledge_dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.knowledge_dir.join(format!("{name}{DOC_EXT}"))
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the lock entry for `name` unless another caller still holds a
    /// handle to it. Must be called with that lock held.
    fn release_lock(&self, name: &str) {
        self.locks.remove_if(name, |_, lock| Arc::strong_count(lock) <= 2);
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn check_name(name: &str) -> Result<(), StoreError> {
        validate_document_name(name).map_err(StoreError::InvalidName)
    }

    fn load(&self, name: &str) -> Result<KnowledgeDocument, StoreError> {
        let path = self.path_for(name);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_owned()))
            }
            Err(e) => return Err(StoreError::read(name, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            document: name.to_owned(),
            message: e.to_string(),
        })
    }

    fn save(&self, doc: &KnowledgeDocument) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec_pretty(doc).map_err(|e| StoreError::write(&doc.name, e))?;
        write_atomic(&self.knowledge_dir, &format!("{}{DOC_EXT}", doc.name), &bytes)
            .map_err(|e| StoreError::write(&doc.name, e))
    }

    /// Create a document. Title/description become a leading note cell.
    pub fn create(&self, name: &str, init: NewDocument) -> Result<KnowledgeDocument, StoreError> {
        Self::check_name(name)?;
        let lock = self.lock_for(name);
        let _guard = lock.lock();

        if self.path_for(name).exists() {
            return Err(StoreError::AlreadyExists(name.to_owned()));
        }

        let now = Utc::now();
        let mut doc = KnowledgeDocument::new(name, now);
        if let Some(header) = header_note(init.title.as_deref(), init.description.as_deref()) {
            doc.push_cell(CellKind::Note, header, None, now);
        }
        for text in init.background {
            if text.trim().is_empty() {
                continue;
            }
            doc.push_cell(CellKind::Background, text, None, now);
        }
        self.save(&doc)?;
        info!(document = name, cells = doc.cells.len(), "document created");
        Ok(doc)
    }

    /// Append a fact/rule block. Durable once this returns.
    pub fn append_background(&self, name: &str, text: &str) -> Result<Cell, StoreError> {
        if text.trim().is_empty() {
            return Err(StoreError::InvalidInput("knowledge text must not be empty".into()));
        }
        self.mutate(name, |doc, now| {
            doc.push_cell(CellKind::Background, text, None, now).clone()
        })
    }

    /// Record an executed query in the document's history.
    pub fn append_query_record(
        &self,
        name: &str,
        query: &str,
        result: &QueryResult,
    ) -> Result<Cell, StoreError> {
        let result = serde_json::to_value(result).map_err(|e| StoreError::write(name, e))?;
        self.mutate(name, |doc, now| {
            doc.push_cell(CellKind::Query, query, Some(result), now).clone()
        })
    }

    fn mutate<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut KnowledgeDocument, chrono::DateTime<Utc>) -> T,
    ) -> Result<T, StoreError> {
        Self::check_name(name)?;
        let lock = self.lock_for(name);
        let _guard = lock.lock();

        let mut doc = self.load(name)?;
        let out = f(&mut doc, Utc::now());
        self.save(&doc)?;
        debug!(document = name, cells = doc.cells.len(), "document updated");
        Ok(out)
    }

    pub fn read(&self, name: &str) -> Result<KnowledgeDocument, StoreError> {
        Self::check_name(name)?;
        self.load(name)
    }

    /// Snapshot of the document's program text.
    pub fn program_text(&self, name: &str) -> Result<String, StoreError> {
        Ok(self.read(name)?.program_text())
    }

    /// All readable documents, sorted by name. Unparseable files are logged
    /// and skipped.
    pub fn list(&self) -> Result<Vec<DocumentSummary>, StoreError> {
        let entries = std::fs::read_dir(&self.knowledge_dir)
            .map_err(|e| StoreError::read("<store>", e))?;
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if is_temp_file(file_name) {
                continue;
            }
            let Some(name) = file_name.strip_suffix(DOC_EXT) else {
                continue;
            };
            if validate_document_name(name).is_err() {
                continue;
            }
            match self.load(name) {
                Ok(doc) => out.push(doc.summary()),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => warn!(document = name, error = %e, "skipping unreadable document"),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    /// Delete a document and its exported notebook.
    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        Self::check_name(name)?;
        let lock = self.lock_for(name);
        let _guard = lock.lock();

        let removed = self.remove_files(name);
        self.release_lock(name);
        removed
    }

    fn remove_files(&self, name: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path_for(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(name.to_owned()))
            }
            Err(e) => return Err(StoreError::write(name, e)),
        }
        let notebook = self.notebooks_dir.join(format!("{name}{NOTEBOOK_EXT}"));
        if let Err(e) = std::fs::remove_file(&notebook) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(document = name, error = %e, "failed to remove exported notebook");
            }
        }
        info!(document = name, "document deleted");
        Ok(())
    }

    /// Write the document as a SWISH notebook into `notebooks/`.
    pub fn export_notebook(&self, name: &str) -> Result<ExportedNotebook, StoreError> {
        let doc = self.read(name)?;
        let content = render_swinb(&doc);
        let file_name = format!("{name}{NOTEBOOK_EXT}");
        write_atomic(&self.notebooks_dir, &file_name, content.as_bytes())
            .map_err(|e| StoreError::write(name, e))?;
        Ok(ExportedNotebook {
            path: self.notebooks_dir.join(file_name),
            content,
        })
    }
}

fn header_note(title: Option<&str>, description: Option<&str>) -> Option<String> {
    let title = title.map(str::trim).filter(|t| !t.is_empty());
    let description = description.map(str::trim).filter(|d| !d.is_empty());
    match (title, description) {
        (None, None) => None,
        (Some(t), None) => Some(format!("# {t}")),
        (None, Some(d)) => Some(d.to_owned()),
        (Some(t), Some(d)) => Some(format!("# {t}\n\n{d}")),
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{DocumentHandle, DocumentStore, ServiceError};
use crate::util::sha256_hex;

/// Content-addressed store: `<root>/documents/<sha256>.pdf`. Storing the same bytes twice
/// yields the same handle.
pub struct LocalDocumentStore {
    documents_dir: PathBuf,
}

impl LocalDocumentStore {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            documents_dir: cache_root.join("documents"),
        }
    }

    pub fn path_for(&self, handle: &DocumentHandle) -> PathBuf {
        self.documents_dir.join(format!("{}.pdf", handle.as_str()))
    }

    pub fn count(&self) -> usize {
        fs::read_dir(&self.documents_dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| {
                        entry.path().extension().and_then(|value| value.to_str()) == Some("pdf")
                    })
                    .count()
            })
            .unwrap_or(0)
    }
}

fn is_valid_handle(handle: &DocumentHandle) -> bool {
    let id = handle.as_str();
    id.len() == 64 && id.chars().all(|character| character.is_ascii_hexdigit())
}

impl DocumentStore for LocalDocumentStore {
    fn put(&self, bytes: &[u8], name: &str) -> Result<DocumentHandle, ServiceError> {
        if bytes.is_empty() {
            return Err(ServiceError::Storage(format!("refusing to store empty document {name}")));
        }

        fs::create_dir_all(&self.documents_dir).map_err(|err| {
            ServiceError::Storage(format!(
                "failed to create {}: {err}",
                self.documents_dir.display()
            ))
        })?;

        let handle = DocumentHandle::new(sha256_hex(bytes));
        let path = self.path_for(&handle);
        if path.exists() {
            debug!(document = %handle, name, "document already stored");
            return Ok(handle);
        }

        fs::write(&path, bytes).map_err(|err| {
            ServiceError::Storage(format!("failed to write {}: {err}", path.display()))
        })?;
        debug!(document = %handle, name, bytes = bytes.len(), "stored document");
        Ok(handle)
    }

    fn get(&self, handle: &DocumentHandle) -> Result<Vec<u8>, ServiceError> {
        if !is_valid_handle(handle) {
            return Err(ServiceError::Storage(format!("malformed document handle {handle}")));
        }

        let path = self.path_for(handle);
        fs::read(&path)
            .map_err(|err| ServiceError::Storage(format!("failed to read {}: {err}", path.display())))
    }
}

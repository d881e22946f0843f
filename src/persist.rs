//! Versioned JSON documents with atomic writes.
//!
//! Every learned artifact (buffer model, residual-agent table, replay
//! buffer) is serialized into an envelope carrying a schema version and
//! written via temp-file-and-rename, so a crash mid-write never corrupts
//! the document read on the next restart. A version mismatch is surfaced
//! as an error; the consuming component rebuilds from defaults instead of
//! misinterpreting the old shape.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("schema version mismatch in {path}: found {found}, expected {expected}")]
    VersionMismatch {
        path: PathBuf,
        found: u32,
        expected: u32,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    schema_version: u32,
    doc: T,
}

/// Directory of versioned JSON documents.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    dir: PathBuf,
}

impl DocumentStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| PersistError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Serialize to a temp file, then rename over the final path.
    pub fn save<T: Serialize>(
        &self,
        name: &str,
        schema_version: u32,
        doc: &T,
    ) -> Result<(), PersistError> {
        let path = self.path_for(name);
        let tmp = self.dir.join(format!("{name}.json.tmp"));
        let envelope = Envelope {
            schema_version,
            doc,
        };
        let bytes = serde_json::to_vec_pretty(&envelope).map_err(|source| {
            PersistError::Malformed {
                path: path.clone(),
                source,
            }
        })?;

        let io_err = |source| PersistError::Io {
            path: tmp.clone(),
            source,
        };
        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(|source| PersistError::Io { path, source })
    }

    /// Load a document. `Ok(None)` when it does not exist yet.
    pub fn load<T: DeserializeOwned>(
        &self,
        name: &str,
        expected_version: u32,
    ) -> Result<Option<T>, PersistError> {
        let path = self.path_for(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistError::Io { path, source }),
        };
        let envelope: Envelope<T> =
            serde_json::from_slice(&bytes).map_err(|source| PersistError::Malformed {
                path: path.clone(),
                source,
            })?;
        if envelope.schema_version != expected_version {
            return Err(PersistError::VersionMismatch {
                path,
                found: envelope.schema_version,
                expected: expected_version,
            });
        }
        Ok(Some(envelope.doc))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

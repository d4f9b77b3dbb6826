//! File-based cache of inferred schemas, keyed by document fingerprint.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::CoreError;
use crate::models::{MatchResult, SchemaSpec};

const SCHEMA_SUFFIX: &str = ".schema.json";

/// Stable content hash of a file: lowercase hex SHA-256, streamed in 8 KiB chunks.
pub fn fingerprint_pdf(path: &Path) -> Result<String, CoreError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Directory of `*.schema.json` files.
#[derive(Debug, Clone)]
pub struct SchemaStore {
    root: PathBuf,
}

impl SchemaStore {
    /// Open the store, creating its directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where `schema` is stored: `<name>-<id>-<fingerprint>.schema.json`.
    ///
    /// The name is reduced to a slug so it can never leave the store directory.
    pub fn schema_path(&self, schema: &SchemaSpec) -> PathBuf {
        self.root.join(format!(
            "{}-{}-{}{SCHEMA_SUFFIX}",
            file_slug(&schema.name),
            schema.id,
            schema.fingerprint
        ))
    }

    pub fn load(&self, path: &Path) -> Result<SchemaSpec, CoreError> {
        load_schema(path)
    }

    pub fn save(&self, schema: &SchemaSpec) -> Result<PathBuf, CoreError> {
        let path = self.schema_path(schema);
        std::fs::write(&path, serde_json::to_string_pretty(schema)?)?;
        tracing::info!(path = %path.display(), schema_id = %schema.id, "saved schema");
        Ok(path)
    }

    /// Every stored schema file, sorted by path.
    pub fn list_schemas(&self) -> Result<Vec<PathBuf>, CoreError> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            let is_schema = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(SCHEMA_SUFFIX));
            if is_schema && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Every readable stored schema, in path order. Unreadable files are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<SchemaSpec>, CoreError> {
        let mut schemas = Vec::new();
        for path in self.list_schemas()? {
            match self.load(&path) {
                Ok(schema) => schemas.push(schema),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable schema")
                }
            }
        }
        Ok(schemas)
    }

    /// First stored schema built from a document with this fingerprint.
    pub fn match_schema(&self, fingerprint: &str) -> Result<MatchResult, CoreError> {
        for schema in self.load_all()? {
            if schema.fingerprint == fingerprint {
                return Ok(MatchResult {
                    matched: true,
                    schema_id: Some(schema.id),
                    score: Some(1.0),
                    reason: Some("fingerprint_match".to_string()),
                });
            }
        }
        Ok(MatchResult {
            matched: false,
            schema_id: None,
            score: None,
            reason: Some("no_match".to_string()),
        })
    }

    /// Stored schema with the given id, if any.
    pub fn find_by_id(&self, schema_id: &str) -> Result<Option<SchemaSpec>, CoreError> {
        Ok(self.load_all()?.into_iter().find(|s| s.id == schema_id))
    }
}

/// Lowercase `[a-z0-9_-]` slug; other runs of characters become one `-`.
fn file_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "schema".to_string()
    } else {
        slug.to_string()
    }
}

/// Read a schema JSON file from anywhere on disk.
pub fn load_schema(path: &Path) -> Result<SchemaSpec, CoreError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

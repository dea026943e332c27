//! Durable record of the repositories each instance has claimed.
//!
//! Every identity owns one file named after the identity token. Each line of the file is a
//! whitespace separated `name id` pair (or just `name` for records written before the id
//! was known). Files are only ever appended to; there is no update or delete.

use crate::metrics_defs::{STORE_APPENDS, STORE_CONFLICTS};
use crate::types::{Identity, RepoRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use shared::counter;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),

    #[error("invalid repository record: {0:?}")]
    InvalidRecord(String),
}

/// Result of an append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// The record (or a more complete one) was already stored.
    AlreadyPresent,
    /// The name is already bound to a different id for this identity. Nothing was written.
    Conflict,
}

#[async_trait]
pub trait RepoStore: Send + Sync {
    /// Creates an empty record for the identity. Returns true if the record is new.
    async fn ensure_record(&self, identity: &str) -> Result<bool, StoreError>;

    async fn append(
        &self,
        identity: &str,
        record: &RepoRecord,
    ) -> Result<AppendOutcome, StoreError>;

    /// Returns the first identity whose record contains the repository name.
    /// No ordering across identities is guaranteed.
    async fn find_identity_by_name(&self, name: &str) -> Result<Option<Identity>, StoreError>;

    /// Returns the first identity whose record contains the repository id.
    /// No ordering across identities is guaranteed.
    async fn find_identity_by_id(&self, id: &str) -> Result<Option<Identity>, StoreError>;

    async fn list_names(&self, identity: &str) -> Result<Vec<String>, StoreError>;

    async fn list_ids(&self, identity: &str) -> Result<Vec<String>, StoreError>;

    /// All identities that have a record.
    async fn identities(&self) -> Result<Vec<Identity>, StoreError>;
}

pub struct FilesystemRepoStore {
    base_dir: PathBuf,
    // One writer per identity at a time. Appends to different identities never contend.
    write_locks: Mutex<HashMap<Identity, Arc<tokio::sync::Mutex<()>>>>,
}

impl FilesystemRepoStore {
    pub fn new<P: Into<PathBuf>>(base_dir: P) -> Self {
        FilesystemRepoStore {
            base_dir: base_dir.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, identity: &str) -> Result<PathBuf, StoreError> {
        validate_identity(identity)?;
        Ok(self.base_dir.join(identity))
    }

    fn write_lock(&self, identity: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .entry(identity.to_string())
            .or_default()
            .clone()
    }

    async fn read_records(&self, identity: &str) -> Result<Vec<RepoRecord>, StoreError> {
        let path = self.record_path(identity)?;
        let content = read_if_exists(&path).await?.unwrap_or_default();
        Ok(content.lines().filter_map(RepoRecord::parse_line).collect())
    }

    /// Linear scan over every record file, returning the first identity with a matching line.
    async fn scan<F>(&self, matches: F) -> Result<Option<Identity>, StoreError>
    where
        F: Fn(&RepoRecord) -> bool + Send,
    {
        for identity in self.identities().await? {
            let path = self.base_dir.join(&identity);
            let content = match read_if_exists(&path).await {
                Ok(Some(content)) => content,
                Ok(None) => continue,
                // One unreadable record must not hide every other identity
                Err(e) => {
                    tracing::warn!(identity = %identity, error = %e, "Skipping unreadable record");
                    continue;
                }
            };
            if content
                .lines()
                .filter_map(RepoRecord::parse_line)
                .any(|record| matches(&record))
            {
                return Ok(Some(identity));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RepoStore for FilesystemRepoStore {
    async fn ensure_record(&self, identity: &str) -> Result<bool, StoreError> {
        let path = self.record_path(identity)?;
        fs::create_dir_all(&self.base_dir).await?;

        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(_) => {
                tracing::info!(identity, "Created repository record");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn append(
        &self,
        identity: &str,
        record: &RepoRecord,
    ) -> Result<AppendOutcome, StoreError> {
        let path = self.record_path(identity)?;
        if !record.is_well_formed() {
            return Err(StoreError::InvalidRecord(record.to_string()));
        }
        let lock = self.write_lock(identity);
        let _guard = lock.lock().await;

        let content = read_if_exists(&path).await?.unwrap_or_default();
        let existing: Vec<RepoRecord> = content.lines().filter_map(RepoRecord::parse_line).collect();

        let outcome = classify(&existing, record);
        match outcome {
            AppendOutcome::Appended => {}
            AppendOutcome::AlreadyPresent => return Ok(outcome),
            AppendOutcome::Conflict => {
                counter!(STORE_CONFLICTS).increment(1);
                tracing::warn!(
                    identity,
                    name = %record.name,
                    id = ?record.id,
                    "Repository name already bound to a different id, skipping append"
                );
                return Ok(outcome);
            }
        }

        fs::create_dir_all(&self.base_dir).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        // Never glue a new line onto a hand-edited file missing its final newline
        let mut line = String::new();
        if !content.is_empty() && !content.ends_with('\n') {
            line.push('\n');
        }
        line.push_str(&record.to_string());
        line.push('\n');

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        counter!(STORE_APPENDS).increment(1);
        tracing::debug!(identity, record = %record, "Appended repository record");
        Ok(AppendOutcome::Appended)
    }

    async fn find_identity_by_name(&self, name: &str) -> Result<Option<Identity>, StoreError> {
        self.scan(|record| record.name == name).await
    }

    async fn find_identity_by_id(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        self.scan(|record| record.id.as_deref() == Some(id)).await
    }

    async fn list_names(&self, identity: &str) -> Result<Vec<String>, StoreError> {
        let mut names: Vec<String> = Vec::new();
        for record in self.read_records(identity).await? {
            if !names.contains(&record.name) {
                names.push(record.name);
            }
        }
        Ok(names)
    }

    async fn list_ids(&self, identity: &str) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = Vec::new();
        for id in self
            .read_records(identity)
            .await?
            .into_iter()
            .filter_map(|record| record.id)
        {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut identities = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) if validate_identity(&name).is_ok() => identities.push(name),
                other => tracing::warn!(file = ?other, "Ignoring unexpected file in store"),
            }
        }
        Ok(identities)
    }
}

/// Decides whether `record` adds information to an identity's existing lines.
fn classify(existing: &[RepoRecord], record: &RepoRecord) -> AppendOutcome {
    let mut same_name = existing.iter().filter(|r| r.name == record.name).peekable();
    if same_name.peek().is_none() {
        return AppendOutcome::Appended;
    }

    let Some(id) = record.id.as_deref() else {
        // Name-only lines never add anything once the name is known
        return AppendOutcome::AlreadyPresent;
    };

    let mut bound_elsewhere = false;
    for r in same_name {
        match r.id.as_deref() {
            Some(existing_id) if existing_id == id => return AppendOutcome::AlreadyPresent,
            Some(_) => bound_elsewhere = true,
            None => {}
        }
    }

    if bound_elsewhere {
        AppendOutcome::Conflict
    } else {
        // Only a legacy name-only line exists; completing it with the id is allowed
        AppendOutcome::Appended
    }
}

/// Identities are used as file names, so anything that could escape the base directory
/// is rejected.
fn validate_identity(identity: &str) -> Result<(), StoreError> {
    let invalid = identity.is_empty()
        || identity == "."
        || identity == ".."
        || identity
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_whitespace());

    if invalid {
        Err(StoreError::InvalidIdentity(identity.to_string()))
    } else {
        Ok(())
    }
}

async fn read_if_exists(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

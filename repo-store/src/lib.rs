pub mod config;
pub mod metrics_defs;
pub mod store;
pub mod types;

pub use store::{AppendOutcome, FilesystemRepoStore, RepoStore, StoreError};
pub use types::{Identity, RepoRecord, is_record_field};

use std::sync::Arc;

pub fn get_store(config: &config::Config) -> Arc<dyn RepoStore> {
    Arc::new(FilesystemRepoStore::new(config.path.clone()))
}

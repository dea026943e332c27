use serde::Deserialize;
use std::path::PathBuf;

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Config {
    /// Directory holding one record file per identity. Created on first write.
    pub path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            path: "./turboSrcInstances".into(),
        }
    }
}

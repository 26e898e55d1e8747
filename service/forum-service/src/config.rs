use std::path::{Path, PathBuf};

use forum_store::tantivy_index::IndexNames;
use serde::{Deserialize, Serialize};

use crate::ServiceError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    /// `None` keeps both indexes in RAM.
    pub index_dir: Option<PathBuf>,
    pub index_names: IndexNames,
    /// Upper bound on reply hits folded into a text search.
    pub max_deep_search_comment_count: usize,
    /// Marker wrapped around highlighted terms.
    pub highlight_tag: String,
    pub default_per_page: usize,
    pub cache_enabled: bool,
    pub cache_ttl_secs: u64,
    pub store_busy_timeout_ms: u64,
    pub index_writer_heap_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("target/forum/forum.db"),
            index_dir: None,
            index_names: IndexNames::default(),
            max_deep_search_comment_count: 5000,
            highlight_tag: "highlight".into(),
            default_per_page: 20,
            cache_enabled: false,
            cache_ttl_secs: 60,
            store_busy_timeout_ms: 5_000,
            index_writer_heap_bytes: 50_000_000,
        }
    }
}

impl ServiceConfig {
    /// Load from a JSON file; absent keys keep their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ServiceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ServiceError::Io(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&raw).map_err(|e| ServiceError::Io(format!("{}: {e}", path.display())))
    }
}

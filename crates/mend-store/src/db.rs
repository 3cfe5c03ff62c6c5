use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use mend_core::types::{BreakerEvent, Feedback, Task, TokenUsage};

use crate::store::StoreError;

/// Per-list retention caps; oldest records are evicted beyond these.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub feedback: usize,
    pub tasks: usize,
    pub token_usage: usize,
    pub breaker_events: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            feedback: 2_000,
            tasks: 2_000,
            token_usage: 10_000,
            breaker_events: 5_000,
        }
    }
}

/// The entire persisted state as one document. File layout matches the
/// on-disk `database.json` keys.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    #[serde(default)]
    pub feedback: VecDeque<Feedback>,
    #[serde(default)]
    pub tasks: VecDeque<Task>,
    #[serde(default)]
    pub token_usage: VecDeque<TokenUsage>,
    #[serde(default)]
    pub breaker_events: VecDeque<BreakerEvent>,
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

impl Document {
    pub fn trim(&mut self, caps: &Retention) {
        while self.feedback.len() > caps.feedback {
            self.feedback.pop_front();
        }
        while self.tasks.len() > caps.tasks {
            self.tasks.pop_front();
        }
        while self.token_usage.len() > caps.token_usage {
            self.token_usage.pop_front();
        }
        while self.breaker_events.len() > caps.breaker_events {
            self.breaker_events.pop_front();
        }
    }
}

pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join("database.json")
}

/// Load the document from `<data_dir>/database.json`, or start empty when
/// the file does not exist yet.
pub async fn load(data_dir: &Path) -> Result<Document, StoreError> {
    let path = database_path(data_dir);
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::default()),
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Write the document atomically: serialize to a sibling temp file, then
/// rename over the target so readers never observe a partial document.
pub async fn save(data_dir: &Path, doc: &Document) -> Result<(), StoreError> {
    tokio::fs::create_dir_all(data_dir).await?;
    let path = database_path(data_dir);
    let tmp = data_dir.join("database.json.tmp");
    let json = serde_json::to_string_pretty(doc)?;
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

//! Where raw upstream payloads come from.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::fs;
use tracksync_core::EntityKind;
use tracksync_normalize::{parse_payload, unwrap_envelope};

/// Yields the raw record list for one entity type, or `None` when upstream has nothing.
#[async_trait]
pub trait PayloadSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, entity: EntityKind) -> Result<Option<JsonValue>>;
}

/// Reads captured responses from `<root>/<source>/<table>.json`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, entity: EntityKind) -> PathBuf {
        self.root
            .join(entity.source().as_str())
            .join(format!("{}.json", entity.table()))
    }
}

#[async_trait]
impl PayloadSource for DirectorySource {
    fn name(&self) -> &str {
        "directory"
    }

    async fn fetch(&self, entity: EntityKind) -> Result<Option<JsonValue>> {
        let path = self.path_for(entity);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking payload path {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        if text.trim().is_empty() {
            return Ok(None);
        }
        let raw = parse_payload(&text).with_context(|| format!("parsing {}", path.display()))?;
        unwrap_envelope(raw).with_context(|| format!("unwrapping {}", path.display()))
    }
}

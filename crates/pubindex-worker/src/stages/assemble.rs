//! Ingest document assembly
//!
//! Wraps extracted documents into search index `GMetaList` ingest documents,
//! at most `max_entries_per_document` entries each.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::AssembleConfig;

use super::Assembler;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GMetaEntry {
    pub subject: String,
    pub visible_to: Vec<String>,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GMetaList {
    pub gmeta: Vec<GMetaEntry>,
}

/// Body posted to the ingest endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestDocument {
    pub ingest_type: String,
    pub ingest_data: GMetaList,
}

impl IngestDocument {
    pub fn new(entries: Vec<GMetaEntry>) -> Self {
        Self {
            ingest_type: "GMetaList".to_string(),
            ingest_data: GMetaList { gmeta: entries },
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestAssembler {
    max_entries_per_document: usize,
    visible_to: Vec<String>,
}

impl IngestAssembler {
    pub fn new(max_entries_per_document: usize, visible_to: Vec<String>) -> Self {
        Self {
            max_entries_per_document: max_entries_per_document.max(1),
            visible_to,
        }
    }

    pub fn from_config(config: &AssembleConfig) -> Self {
        Self::new(config.max_entries_per_document, config.visible_to.clone())
    }

    fn entry(&self, file: &Path, content: Value) -> GMetaEntry {
        let subject = content
            .get("subject")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| {
                file.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });

        GMetaEntry {
            subject,
            visible_to: self.visible_to.clone(),
            content,
        }
    }
}

#[async_trait]
impl Assembler for IngestAssembler {
    async fn assemble(&self, extracted_dir: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        let mut inputs = Vec::new();
        let mut dir = tokio::fs::read_dir(extracted_dir)
            .await
            .with_context(|| format!("Failed to read {}", extracted_dir.display()))?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                inputs.push(path);
            }
        }
        inputs.sort();

        if inputs.is_empty() {
            anyhow::bail!("no extracted documents in {}", extracted_dir.display());
        }

        let mut entries = Vec::with_capacity(inputs.len());
        for path in &inputs {
            let raw = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let content: Value = serde_json::from_slice(&raw)
                .with_context(|| format!("{} is not valid JSON", path.display()))?;
            entries.push(self.entry(path, content));
        }

        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let mut written = Vec::new();
        for (index, batch) in entries.chunks(self.max_entries_per_document).enumerate() {
            let document = IngestDocument::new(batch.to_vec());
            let path = output_dir.join(format!("ingest-{:04}.json", index));
            tokio::fs::write(&path, serde_json::to_vec_pretty(&document)?)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            debug!(file = %path.display(), entries = batch.len(), "Wrote ingest document");
            written.push(path);
        }

        info!(documents = written.len(), entries = entries.len(), "Ingest documents assembled");
        Ok(written)
    }
}

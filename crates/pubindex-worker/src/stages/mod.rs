//! Pipeline stages
//!
//! The controller only talks to its collaborators through the traits in this
//! module. Production implementations live in the submodules; tests swap in
//! fakes.
//!
//! Stage implementations return `anyhow::Result` with context attached; the
//! controller turns failures into a [`crate::error::StageError`] carrying the
//! [`Stage`] that failed.

pub mod assemble;
pub mod copy;
pub mod extract;
pub mod notify;
pub mod submit;

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

use pubindex_common::types::{ResourceId, Secret, TaskId};

use crate::error::NotifyError;
use crate::message::PublicationKind;

pub use assemble::IngestAssembler;
pub use copy::LocalFileStager;
pub use extract::{AttributeProbe, ExtractSettings, FileMetadataExtractor, NoopProbe};
pub use notify::PortalClient;
pub use submit::SearchSubmitter;

/// Named step of the pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Validation,
    Copy,
    Extract,
    Assemble,
    Submit,
    Notify,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Validation => "validation",
            Stage::Copy => "copy",
            Stage::Extract => "extract",
            Stage::Assemble => "assemble",
            Stage::Submit => "submit",
            Stage::Notify => "notify",
        }
    }

    /// Whether a failure in this stage ends processing of the message.
    /// Only the portal callback is best-effort.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Stage::Notify)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Copies message files from their volatile source into the staging area
#[async_trait]
pub trait FileStager: Send + Sync {
    /// Stage `source` below `target_dir` and return where it landed.
    ///
    /// A file ends up at `target_dir/<file name>`. A directory has its
    /// contents copied into `target_dir`, which is returned.
    async fn stage(&self, source: &Path, target_dir: &Path) -> Result<PathBuf>;

    /// Stage one entry of a list publication.
    ///
    /// A file is staged as by [`FileStager::stage`]. A directory keeps its
    /// own subtree at `target_dir/<dir name>`, which is returned, so entries
    /// never share a staged root.
    async fn stage_entry(&self, source: &Path, target_dir: &Path) -> Result<PathBuf>;
}

/// Everything the extractor needs to know about one message
#[derive(Debug, Clone)]
pub struct ExtractRequest<'a> {
    pub resource_id: &'a ResourceId,
    pub kind: PublicationKind,
    pub publication_name: Option<&'a str>,
    pub description: Option<&'a str>,
    pub keywords: &'a [String],
    pub target_dir: &'a Path,
    /// Staged locations, in message order
    pub staged: &'a [PathBuf],
    /// Directory that receives the extracted documents
    pub output_dir: &'a Path,
}

/// Turns staged files into metadata documents on disk
#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    /// Returns the documents written, in no particular order
    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<Vec<PathBuf>>;
}

/// Turns extracted metadata into ingest-ready documents
#[async_trait]
pub trait Assembler: Send + Sync {
    /// Returns the documents written, sorted by file name
    async fn assemble(&self, extracted_dir: &Path, output_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Registers one ingest document with the search index
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, document: &Path, index_id: &str) -> Result<TaskId>;
}

/// Reports a task id back to the portal
#[async_trait]
pub trait PortalNotifier: Send + Sync {
    async fn notify(
        &self,
        credential: Option<&Secret>,
        resource_id: &ResourceId,
        task_id: &TaskId,
    ) -> std::result::Result<(), NotifyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_notify_is_best_effort() {
        for stage in [
            Stage::Validation,
            Stage::Copy,
            Stage::Extract,
            Stage::Assemble,
            Stage::Submit,
        ] {
            assert!(stage.is_terminal(), "{} should be terminal", stage);
        }
        assert!(!Stage::Notify.is_terminal());
        assert_eq!(Stage::Assemble.to_string(), "assemble");
    }
}

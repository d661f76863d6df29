//! Pipeline controller
//!
//! Drives one [`Message`] through copy, extract, assemble, submit and notify.
//! Stages run strictly in order and the first failure ends processing; the
//! controller never retries a stage. Every failure is converted into an
//! [`Outcome`] here, so callers never see a panic or an error type from a
//! collaborator.
//!
//! Notify is the only best-effort stage: a failed portal callback is logged
//! at warn level and the outcome stays [`Outcome::Ok`].

use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

use pubindex_common::types::TaskId;

use crate::config::Settings;
use crate::error::{NotifyError, StageError, ValidationError};
use crate::ledger::TaskLedger;
use crate::message::{Message, PublicationKind};
use crate::stages::{
    Assembler, ExtractRequest, ExtractSettings, FileMetadataExtractor, FileStager,
    IngestAssembler, LocalFileStager, MetadataExtractor, PortalClient, PortalNotifier,
    SearchSubmitter, Stage, Submitter,
};

/// Result of processing one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Failed(StageError),
}

impl Outcome {
    /// Outcome of a message that never reached the controller
    pub fn rejected(err: ValidationError) -> Self {
        Outcome::Failed(err.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok)
    }

    pub fn failed_stage(&self) -> Option<Stage> {
        match self {
            Outcome::Ok => None,
            Outcome::Failed(err) => Some(err.stage),
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Ok => f.write_str("ok"),
            Outcome::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

/// Locations and limits used by the controller
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub staging_root: PathBuf,
    pub output_root: PathBuf,
    pub index_id: String,
    /// Upper bound for copy, submit and notify
    pub stage_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            staging_root: settings.paths.staging_root.clone(),
            output_root: settings.paths.output_root.clone(),
            index_id: settings.search.index_id.clone(),
            stage_timeout: settings.pipeline.stage_timeout(),
        }
    }

    fn extracted_dir(&self, resource_id: &str) -> PathBuf {
        self.output_root.join(resource_id).join("extracted")
    }

    fn assembled_dir(&self, resource_id: &str) -> PathBuf {
        self.output_root.join(resource_id).join("assembled")
    }
}

/// The controller's collaborators
#[derive(Clone)]
pub struct Stages {
    pub stager: Arc<dyn FileStager>,
    pub extractor: Arc<dyn MetadataExtractor>,
    pub assembler: Arc<dyn Assembler>,
    pub submitter: Arc<dyn Submitter>,
    pub notifier: Arc<dyn PortalNotifier>,
}

impl Stages {
    /// Production implementations configured from settings
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let mut stager = LocalFileStager::new();
        if let Some(root) = &settings.paths.source_root {
            stager = stager.with_source_root(root);
        }

        Ok(Self {
            stager: Arc::new(stager),
            extractor: Arc::new(FileMetadataExtractor::new(ExtractSettings::from_config(
                &settings.extract,
            )?)),
            assembler: Arc::new(IngestAssembler::from_config(&settings.assemble)),
            submitter: Arc::new(SearchSubmitter::from_config(&settings.search)?),
            notifier: Arc::new(PortalClient::from_config(&settings.portal)?),
        })
    }
}

/// Anything that can take a decoded message off the consumer's hands
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Outcome;
}

pub struct Controller {
    settings: PipelineSettings,
    stages: Stages,
    ledger: Arc<TaskLedger>,
}

impl Controller {
    pub fn new(settings: PipelineSettings, stages: Stages, ledger: Arc<TaskLedger>) -> Self {
        Self {
            settings,
            stages,
            ledger,
        }
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self::new(
            PipelineSettings::from_settings(settings),
            Stages::from_settings(settings)?,
            Arc::new(TaskLedger::new(&settings.paths.ledger_file)),
        ))
    }

    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    /// Run every stage for `message` and report how far it got
    pub async fn process(&self, message: &Message) -> Outcome {
        let span = info_span!(
            "process",
            resource_id = %message.resource_id(),
            kind = %message.kind()
        );

        async {
            info!(paths = message.source_paths().len(), "Processing message");
            let outcome = match self.run(message).await {
                Ok(()) => Outcome::Ok,
                Err(err) => Outcome::Failed(err),
            };
            match &outcome {
                Outcome::Ok => info!("Message processed"),
                Outcome::Failed(err) => {
                    error!(stage = %err.stage, cause = %err.cause, "Message processing failed")
                },
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn run(&self, message: &Message) -> Result<(), StageError> {
        message.validate()?;

        let resource_id = message.resource_id().as_str();
        let target_dir = message.target_dir(&self.settings.staging_root);
        let extracted_dir = self.settings.extracted_dir(resource_id);
        let assembled_dir = self.settings.assembled_dir(resource_id);

        // copy
        if !message.names_target_dir() {
            reset_dir(&target_dir)
                .await
                .map_err(|e| StageError::from_anyhow(Stage::Copy, &e))?;
        }
        let stager = &self.stages.stager;
        let mut staged = Vec::with_capacity(message.source_paths().len());
        for source in message.source_paths() {
            let path = match message.kind() {
                PublicationKind::List => {
                    self.bounded(Stage::Copy, stager.stage_entry(source, &target_dir))
                        .await?
                },
                _ => self.bounded(Stage::Copy, stager.stage(source, &target_dir)).await?,
            };
            staged.push(path);
        }

        // extract
        reset_dir(&extracted_dir)
            .await
            .map_err(|e| StageError::from_anyhow(Stage::Extract, &e))?;
        let request = ExtractRequest {
            resource_id: message.resource_id(),
            kind: message.kind(),
            publication_name: message.publication_name(),
            description: message.description(),
            keywords: message.keywords(),
            target_dir: &target_dir,
            staged: &staged,
            output_dir: &extracted_dir,
        };
        self.stages
            .extractor
            .extract(&request)
            .await
            .map_err(|e| StageError::from_anyhow(Stage::Extract, &e))?;

        // assemble
        reset_dir(&assembled_dir)
            .await
            .map_err(|e| StageError::from_anyhow(Stage::Assemble, &e))?;
        let documents = self
            .stages
            .assembler
            .assemble(&extracted_dir, &assembled_dir)
            .await
            .map_err(|e| StageError::from_anyhow(Stage::Assemble, &e))?;
        if documents.is_empty() {
            return Err(StageError::new(Stage::Assemble, "no ingest documents produced"));
        }

        // submit
        let mut pass = self.ledger.pass();
        for document in &documents {
            let task_id = self
                .bounded(
                    Stage::Submit,
                    self.stages.submitter.submit(document, &self.settings.index_id),
                )
                .await?;
            pass.record(task_id)
                .await
                .map_err(|e| StageError::new(Stage::Submit, format!("failed to record task id: {}", e)))?;
        }

        // notify
        match pass.claim_latest() {
            Some(task_id) => self.notify(message, &task_id).await,
            None => warn!(stage = "notify", "No task id recorded, skipping portal callback"),
        }

        Ok(())
    }

    async fn notify(&self, message: &Message, task_id: &TaskId) {
        let call = self
            .stages
            .notifier
            .notify(message.auth_token(), message.resource_id(), task_id);

        let result = match tokio::time::timeout(self.settings.stage_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(NotifyError::Timeout(self.settings.stage_timeout.as_secs())),
        };

        if let Err(err) = result {
            warn!(stage = "notify", task_id = %task_id, cause = %err, "Portal callback failed");
        }
    }

    /// Await a stage future under the stage timeout
    async fn bounded<T, F>(&self, stage: Stage, fut: F) -> Result<T, StageError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.settings.stage_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(StageError::from_anyhow(stage, &err)),
            Err(_) => Err(StageError::timed_out(stage, self.settings.stage_timeout)),
        }
    }
}

#[async_trait]
impl MessageHandler for Controller {
    async fn handle(&self, message: &Message) -> Outcome {
        self.process(message).await
    }
}

/// Remove leftovers of an earlier run and recreate the directory
async fn reset_dir(dir: &Path) -> anyhow::Result<()> {
    use anyhow::Context;

    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => return Err(e).with_context(|| format!("Failed to clear {}", dir.display())),
    }
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))
}

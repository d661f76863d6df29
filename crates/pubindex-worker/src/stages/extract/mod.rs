//! File introspection and metadata documents
//!
//! For every staged file the extractor records basic facts (name, size,
//! permissions, modification time, checksum, tags derived from the
//! extension), optionally the head of readable text files, and whatever an
//! [`AttributeProbe`] reports. Files are grouped into documents according to
//! the publication kind:
//!
//! | kind       | documents                              | subject              |
//! |------------|----------------------------------------|----------------------|
//! | `single`   | one for the staged file                | `<resource_id>`      |
//! | `multiple` | one aggregate for the staged tree      | `<resource_id>`      |
//! | `list`     | one per list entry                     | `<resource_id>/<name>` |
//!
//! Each document is written as `<sha256(subject)>.json` into the output
//! directory and carries a schema.org `Dataset` description.

mod schemaorg;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use walkdir::WalkDir;

use pubindex_common::checksum::{compute_file_checksum, hashed_file_name};

use crate::config::{CreatorConfig, ExtractConfig};
use crate::message::PublicationKind;

use super::{ExtractRequest, MetadataExtractor};

pub use schemaorg::BoundingBox;

/// Format-specific introspection (raster bands, vector extents, ...).
///
/// Returns a flat attribute map, or `None` when the file is not understood.
/// Keys `southlimit`, `westlimit`, `northlimit` and `eastlimit` feed the
/// spatial coverage of the dataset description.
pub trait AttributeProbe: Send + Sync {
    fn probe(&self, path: &Path) -> Result<Option<Map<String, Value>>>;
}

/// Probe that never reports anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProbe;

impl AttributeProbe for NoopProbe {
    fn probe(&self, _path: &Path) -> Result<Option<Map<String, Value>>> {
        Ok(None)
    }
}

/// Compiled extraction settings
#[derive(Debug, Clone)]
pub struct ExtractSettings {
    pub head_length: usize,
    pub read_head_files: Vec<glob::Pattern>,
    pub skip_preamble_patterns: Vec<Regex>,
    pub site_url: String,
    pub creator: CreatorConfig,
    pub publisher: String,
    pub catalog_name: String,
    pub license_text: String,
    pub license_url: String,
}

impl ExtractSettings {
    /// Compile glob and regex patterns from the settings file
    pub fn from_config(config: &ExtractConfig) -> Result<Self> {
        let read_head_files = config
            .read_head_files
            .iter()
            .map(|p| glob::Pattern::new(p).with_context(|| format!("Invalid read-head glob '{}'", p)))
            .collect::<Result<Vec<_>>>()?;

        let skip_preamble_patterns = config
            .skip_preamble_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid skip-preamble regex '{}'", p)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            head_length: config.head_length,
            read_head_files,
            skip_preamble_patterns,
            site_url: config.site_url.trim_end_matches('/').to_string(),
            creator: config.creator.clone(),
            publisher: config.publisher.clone(),
            catalog_name: config.catalog_name.clone(),
            license_text: config.license_text.clone(),
            license_url: config.license_url.clone(),
        })
    }

    fn wants_head(&self, name: &str) -> bool {
        self.read_head_files.iter().any(|p| p.matches(name))
    }

    pub(crate) fn resource_url(&self, resource_id: &str) -> String {
        format!("{}/resource/{}", self.site_url, resource_id)
    }

    pub(crate) fn download_url(&self, resource_id: &str) -> String {
        format!("{}/api/resource/download/{}", self.site_url, resource_id)
    }
}

/// Facts about one staged file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub name: String,
    /// Path relative to the staged location of the publication
    pub relpath: String,
    pub extension: Option<String>,
    pub tags: Vec<String>,
    pub size_bytes: u64,
    pub mode: String,
    pub mtime: DateTime<Utc>,
    pub sha256: String,
    pub head: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Map<String, Value>>,
}

/// One extracted document as written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub subject: String,
    pub resource_id: String,
    pub kind: PublicationKind,
    pub publication_name: Option<String>,
    pub files: Vec<FileRecord>,
    #[serde(rename = "schemaorgJson")]
    pub schemaorg: Value,
}

/// Extractor working on the local staging area
#[derive(Clone)]
pub struct FileMetadataExtractor {
    settings: Arc<ExtractSettings>,
    probe: Arc<dyn AttributeProbe>,
}

impl FileMetadataExtractor {
    pub fn new(settings: ExtractSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            probe: Arc::new(NoopProbe),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn AttributeProbe>) -> Self {
        self.probe = probe;
        self
    }
}

impl std::fmt::Debug for FileMetadataExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMetadataExtractor")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Owned copy of the request, moved onto the blocking pool
struct Job {
    resource_id: String,
    kind: PublicationKind,
    publication_name: Option<String>,
    description: Option<String>,
    keywords: Vec<String>,
    staged: Vec<PathBuf>,
    output_dir: PathBuf,
}

#[async_trait]
impl MetadataExtractor for FileMetadataExtractor {
    async fn extract(&self, request: &ExtractRequest<'_>) -> Result<Vec<PathBuf>> {
        let job = Job {
            resource_id: request.resource_id.as_str().to_string(),
            kind: request.kind,
            publication_name: request.publication_name.map(str::to_string),
            description: request.description.map(str::to_string),
            keywords: request.keywords.to_vec(),
            staged: request.staged.to_vec(),
            output_dir: request.output_dir.to_path_buf(),
        };
        let settings = self.settings.clone();
        let probe = self.probe.clone();

        let written = tokio::task::spawn_blocking(move || run_job(&job, &settings, probe.as_ref()))
            .await
            .context("Extract task panicked")??;

        info!(documents = written.len(), "Metadata extracted");
        Ok(written)
    }
}

fn run_job(job: &Job, settings: &ExtractSettings, probe: &dyn AttributeProbe) -> Result<Vec<PathBuf>> {
    if job.staged.is_empty() {
        bail!("nothing was staged");
    }
    std::fs::create_dir_all(&job.output_dir)
        .with_context(|| format!("Failed to create {}", job.output_dir.display()))?;

    let mut groups: Vec<(String, Option<String>, Vec<FileRecord>)> = Vec::new();

    match job.kind {
        PublicationKind::Single => {
            let path = &job.staged[0];
            if !path.is_file() {
                bail!("single publication expects a file, {} is not one", path.display());
            }
            let record = describe_file(path, path.parent().unwrap_or(path), settings, probe)?;
            let name = record.name.clone();
            groups.push((job.resource_id.clone(), Some(name), vec![record]));
        },
        PublicationKind::Multiple => {
            let root = &job.staged[0];
            let records = describe_entry(root, settings, probe)?;
            if records.is_empty() {
                bail!("staged directory {} contains no files", root.display());
            }
            groups.push((job.resource_id.clone(), None, records));
        },
        PublicationKind::List => {
            for path in &job.staged {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .with_context(|| format!("Staged entry {} has no file name", path.display()))?;
                let records = describe_entry(path, settings, probe)?;
                groups.push((format!("{}/{}", job.resource_id, name), Some(name), records));
            }
        },
    }

    let mut written = Vec::with_capacity(groups.len());
    for (subject, entry_name, files) in groups {
        let name = job
            .publication_name
            .clone()
            .filter(|_| job.kind != PublicationKind::List)
            .or(entry_name)
            .unwrap_or_else(|| job.resource_id.clone());

        let schemaorg = schemaorg::build_dataset(
            &schemaorg::DatasetInfo {
                resource_id: &job.resource_id,
                name: &name,
                description: job.description.as_deref(),
                keywords: &job.keywords,
            },
            &files,
            settings,
        );

        let document = ExtractedDocument {
            subject: subject.clone(),
            resource_id: job.resource_id.clone(),
            kind: job.kind,
            publication_name: job.publication_name.clone(),
            files,
            schemaorg,
        };

        let path = job.output_dir.join(hashed_file_name(&subject, "json"));
        let json = serde_json::to_vec_pretty(&document)?;
        std::fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        debug!(subject = %subject, file = %path.display(), "Wrote extracted document");
        written.push(path);
    }

    Ok(written)
}

/// Describe a file, or every file below a directory in path order
fn describe_entry(path: &Path, settings: &ExtractSettings, probe: &dyn AttributeProbe) -> Result<Vec<FileRecord>> {
    if path.is_file() {
        let base = path.parent().unwrap_or(path);
        return Ok(vec![describe_file(path, base, settings, probe)?]);
    }

    let mut records = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", path.display()))?;
        if entry.file_type().is_file() {
            records.push(describe_file(entry.path(), path, settings, probe)?);
        }
    }
    Ok(records)
}

pub fn describe_file(
    path: &Path,
    base: &Path,
    settings: &ExtractSettings,
    probe: &dyn AttributeProbe,
) -> Result<FileRecord> {
    let meta = std::fs::metadata(path).with_context(|| format!("Failed to stat {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))?;
    let relpath = path
        .strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned();
    let extension = file_extension(&name);
    let mtime: DateTime<Utc> = meta
        .modified()
        .with_context(|| format!("No modification time for {}", path.display()))?
        .into();

    let head = if settings.wants_head(&name) {
        read_head(path, settings)?
    } else {
        None
    };

    let attributes = probe
        .probe(path)
        .with_context(|| format!("Attribute probe failed for {}", path.display()))?;

    Ok(FileRecord {
        tags: file_tags(extension.as_deref()),
        extension,
        name,
        relpath,
        size_bytes: meta.len(),
        mode: file_mode(&meta),
        mtime,
        sha256: compute_file_checksum(path)?,
        head,
        attributes,
    })
}

/// Text after the last dot, if any
pub fn file_extension(name: &str) -> Option<String> {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty())
}

pub fn file_tags(extension: Option<&str>) -> Vec<String> {
    let class = match extension {
        Some("tif" | "tiff" | "geotiff" | "img" | "nc" | "hdf" | "h5" | "asc" | "dem" | "jp2" | "vrt") => {
            "raster"
        },
        Some("shp" | "shx" | "dbf" | "prj" | "geojson" | "kml" | "kmz" | "gpkg" | "gml") => "vector",
        Some("csv" | "tsv" | "xls" | "xlsx" | "parquet") => "tabular",
        Some("txt" | "md" | "rst" | "json" | "xml" | "yaml" | "yml" | "html" | "py" | "ipynb") => "text",
        Some("zip" | "tar" | "gz" | "tgz" | "bz2" | "xz" | "7z") => "archive",
        _ => "binary",
    };
    vec!["file".to_string(), class.to_string()]
}

/// Leading characters of a text file.
///
/// Twice the head length is read so a skipped preamble still leaves enough
/// text; the head starts after the first preamble pattern that matches.
pub fn read_head(path: &Path, settings: &ExtractSettings) -> Result<Option<String>> {
    let window = settings.head_length.saturating_mul(2);
    // at most 4 bytes per UTF-8 char
    let mut buf = Vec::new();
    std::fs::File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?
        .take((window as u64).saturating_mul(4))
        .read_to_end(&mut buf)?;

    let text: String = String::from_utf8_lossy(&buf).chars().take(window).collect();

    let start = settings
        .skip_preamble_patterns
        .iter()
        .find_map(|re| re.find(&text).map(|m| m.end()))
        .unwrap_or(0);

    let head: String = text[start..].chars().take(settings.head_length).collect();
    Ok(Some(head))
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("0o{:o}", meta.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(meta: &std::fs::Metadata) -> String {
    if meta.permissions().readonly() {
        "0o444".to_string()
    } else {
        "0o644".to_string()
    }
}

//! Inbound queue message
//!
//! A broker payload is decoded exactly once into a [`Message`]. Decoding
//! rejects payloads that are not JSON, lack `uuid`, `path` or `type`, or name
//! an unknown publication type. Content checks that the pipeline reports as a
//! `validation` outcome (empty paths, ambiguous list entries) live in
//! [`Message::validate`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use pubindex_common::types::{ResourceId, Secret};

use crate::error::ValidationError;

/// Staging and extraction strategy for a publication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicationKind {
    /// One file
    Single,
    /// One directory, indexed as a single aggregate record
    Multiple,
    /// An ordered list of paths, one record per entry
    List,
}

impl PublicationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationKind::Single => "single",
            PublicationKind::Multiple => "multiple",
            PublicationKind::List => "list",
        }
    }
}

impl std::fmt::Display for PublicationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PathField {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KeywordsField {
    List(Vec<String>),
    Joined(String),
}

/// Wire shape of the payload
#[derive(Deserialize)]
struct RawMessage {
    uuid: String,
    path: PathField,
    #[serde(rename = "type")]
    kind: PublicationKind,
    #[serde(default)]
    publication_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    keywords: Option<KeywordsField>,
    #[serde(default)]
    user_jupyter_token: Option<Secret>,
    #[serde(default)]
    target_dir: Option<String>,
}

/// One validated-at-the-boundary unit of work. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    resource_id: ResourceId,
    kind: PublicationKind,
    source_paths: Vec<PathBuf>,
    publication_name: Option<String>,
    description: Option<String>,
    keywords: Vec<String>,
    auth_token: Option<Secret>,
    legacy_target_dir: Option<PathBuf>,
}

impl Message {
    pub fn new(resource_id: ResourceId, kind: PublicationKind, source_paths: Vec<PathBuf>) -> Self {
        Self {
            resource_id,
            kind,
            source_paths,
            publication_name: None,
            description: None,
            keywords: Vec::new(),
            auth_token: None,
            legacy_target_dir: None,
        }
    }

    /// Decode a broker payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, ValidationError> {
        let raw: RawMessage = serde_json::from_slice(payload)
            .map_err(|e| ValidationError::new(format!("undecodable payload: {}", e)))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawMessage) -> Result<Self, ValidationError> {
        let resource_id =
            ResourceId::new(raw.uuid).map_err(|e| ValidationError::new(e.to_string()))?;

        let source_paths = match raw.path {
            PathField::One(path) if path.trim().is_empty() => Vec::new(),
            PathField::One(path) => vec![PathBuf::from(path.trim())],
            PathField::Many(paths) => paths.into_iter().map(|p| PathBuf::from(p.trim())).collect(),
        };

        let keywords = match raw.keywords {
            Some(KeywordsField::List(list)) => list,
            Some(KeywordsField::Joined(joined)) => joined.split(',').map(str::to_string).collect(),
            None => Vec::new(),
        }
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();

        Ok(Self {
            resource_id,
            kind: raw.kind,
            source_paths,
            publication_name: non_blank(raw.publication_name),
            description: non_blank(raw.description),
            keywords,
            auth_token: raw.user_jupyter_token.filter(|t| !t.is_empty()),
            legacy_target_dir: non_blank(raw.target_dir).map(PathBuf::from),
        })
    }

    pub fn with_publication_name(mut self, name: impl Into<String>) -> Self {
        self.publication_name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_auth_token(mut self, token: Secret) -> Self {
        self.auth_token = Some(token);
        self
    }

    pub fn with_target_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.legacy_target_dir = Some(dir.into());
        self
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    pub fn kind(&self) -> PublicationKind {
        self.kind
    }

    pub fn source_paths(&self) -> &[PathBuf] {
        &self.source_paths
    }

    pub fn publication_name(&self) -> Option<&str> {
        self.publication_name.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn auth_token(&self) -> Option<&Secret> {
        self.auth_token.as_ref()
    }

    /// Check the preconditions of the pipeline. Performs no I/O.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source_paths.is_empty() {
            return Err(ValidationError::new("source path must not be empty"));
        }

        if self.source_paths.iter().any(|p| p.as_os_str().is_empty()) {
            return Err(ValidationError::new("source path list contains an empty entry"));
        }

        if let Some(dir) = &self.legacy_target_dir {
            if !is_confined(dir) {
                return Err(ValidationError::new(format!(
                    "target_dir '{}' must be a relative path below the staging area",
                    dir.display()
                )));
            }
        }

        match self.kind {
            PublicationKind::Single | PublicationKind::Multiple if self.source_paths.len() > 1 => {
                Err(ValidationError::new(format!(
                    "a {} publication takes exactly one path, got {}",
                    self.kind,
                    self.source_paths.len()
                )))
            },
            PublicationKind::List => {
                let mut seen = HashSet::new();
                for path in &self.source_paths {
                    let name = path.file_name().ok_or_else(|| {
                        ValidationError::new(format!(
                            "list entry '{}' has no file name",
                            path.display()
                        ))
                    })?;
                    if !seen.insert(name.to_os_string()) {
                        return Err(ValidationError::new(format!(
                            "list entries share the file name '{}'",
                            name.to_string_lossy()
                        )));
                    }
                }
                Ok(())
            },
            _ => Ok(()),
        }
    }

    /// Whether the staging directory comes from the payload's `target_dir`.
    /// Such a directory may be shared, so the pipeline never clears it.
    pub fn names_target_dir(&self) -> bool {
        self.kind == PublicationKind::Single
            && self.legacy_target_dir.as_deref().is_some_and(is_confined)
    }

    /// Staging directory for this message, always below `staging_root`.
    ///
    /// Derived from the resource id, except for legacy single-file messages
    /// that name their own relative `target_dir`.
    pub fn target_dir(&self, staging_root: &Path) -> PathBuf {
        match &self.legacy_target_dir {
            Some(dir) if self.names_target_dir() => staging_root.join(dir),
            _ => staging_root.join(self.resource_id.as_str()),
        }
    }
}

/// Relative, free of `..`, and naming at least one directory
fn is_confined(dir: &Path) -> bool {
    let mut named = false;
    for component in dir.components() {
        match component {
            Component::Normal(_) => named = true,
            Component::CurDir => {},
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    named
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_full_payload() {
        let payload = br#"{
            "uuid": "r2",
            "path": "/stage/r2/elevation.tif",
            "publication_name": "Elevation",
            "type": "single",
            "description": "DEM for the basin",
            "keywords": ["dem", " hydrology ", ""],
            "user_jupyter_token": "tok"
        }"#;

        let msg = Message::from_slice(payload).unwrap();
        assert_eq!(msg.resource_id().as_str(), "r2");
        assert_eq!(msg.kind(), PublicationKind::Single);
        assert_eq!(msg.source_paths(), &[PathBuf::from("/stage/r2/elevation.tif")]);
        assert_eq!(msg.publication_name(), Some("Elevation"));
        assert_eq!(msg.keywords(), &["dem".to_string(), "hydrology".to_string()]);
        assert_eq!(msg.auth_token().unwrap().expose(), "tok");
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_empty_path_decodes_but_fails_validation() {
        let msg = Message::from_slice(br#"{"uuid":"r1","path":"","type":"single"}"#).unwrap();
        assert!(msg.source_paths().is_empty());
        assert_eq!(
            msg.validate().unwrap_err(),
            ValidationError::new("source path must not be empty")
        );
    }

    #[test]
    fn test_missing_required_fields_are_rejected() {
        assert!(Message::from_slice(br#"{"uuid":"r1","type":"single"}"#).is_err());
        assert!(Message::from_slice(br#"{"path":"/a","type":"single"}"#).is_err());
        assert!(Message::from_slice(br#"{"uuid":"r1","path":"/a"}"#).is_err());
        assert!(Message::from_slice(br#"{"uuid":"","path":"/a","type":"single"}"#).is_err());
    }

    #[test]
    fn test_unknown_kind_and_garbage_are_rejected() {
        let err = Message::from_slice(br#"{"uuid":"r1","path":"/a","type":"folder"}"#).unwrap_err();
        assert!(err.0.contains("undecodable payload"));
        assert!(Message::from_slice(b"not json at all").is_err());
    }

    #[test]
    fn test_list_paths_and_joined_keywords() {
        let msg = Message::from_slice(
            br#"{"uuid":"r3","path":["/a/x.tif","/b/y.shp"],"type":"list","keywords":"a, b"}"#,
        )
        .unwrap();
        assert_eq!(msg.source_paths().len(), 2);
        assert_eq!(msg.keywords(), &["a".to_string(), "b".to_string()]);
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_list_with_duplicate_file_names_fails_validation() {
        let msg = Message::new(
            ResourceId::new("r4").unwrap(),
            PublicationKind::List,
            vec![PathBuf::from("/a/data.csv"), PathBuf::from("/b/data.csv")],
        );
        assert!(msg.validate().unwrap_err().0.contains("data.csv"));
    }

    #[test]
    fn test_single_with_several_paths_fails_validation() {
        let msg = Message::new(
            ResourceId::new("r5").unwrap(),
            PublicationKind::Single,
            vec![PathBuf::from("/a"), PathBuf::from("/b")],
        );
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_target_dir_derivation() {
        let root = Path::new("/work/staging");
        let multiple = Message::from_slice(br#"{"uuid":"r6","path":"/d","type":"multiple","target_dir":"ignored"}"#)
            .unwrap();
        assert_eq!(multiple.target_dir(root), PathBuf::from("/work/staging/r6"));

        let legacy = Message::from_slice(br#"{"uuid":"r7","path":"/f.tif","type":"single","target_dir":"legacy/r7"}"#)
            .unwrap();
        assert_eq!(legacy.target_dir(root), PathBuf::from("/work/staging/legacy/r7"));

        let plain = Message::from_slice(br#"{"uuid":"r8","path":"/f.tif","type":"single"}"#).unwrap();
        assert_eq!(plain.target_dir(root), PathBuf::from("/work/staging/r8"));
    }

    #[test]
    fn test_target_dir_outside_staging_fails_validation() {
        for dir in ["/etc/cron.d", "../../home/user", "legacy/../../escape", "."] {
            let payload = serde_json::json!({
                "uuid": "r10", "path": "/f.tif", "type": "single", "target_dir": dir
            });
            let msg = Message::from_slice(&serde_json::to_vec(&payload).unwrap()).unwrap();
            let err = msg.validate().unwrap_err();
            assert!(err.0.contains("target_dir"), "{} accepted", dir);

            // never leaves the staging root even without validation
            let root = Path::new("/work/staging");
            assert_eq!(msg.target_dir(root), PathBuf::from("/work/staging/r10"));
            assert!(!msg.names_target_dir());
        }
    }

    #[test]
    fn test_debug_output_hides_token() {
        let msg = Message::from_slice(
            br#"{"uuid":"r9","path":"/f","type":"single","user_jupyter_token":"very-secret"}"#,
        )
        .unwrap();
        assert!(!format!("{:?}", msg).contains("very-secret"));
    }
}

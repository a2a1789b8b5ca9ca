use crate::event::ScanId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Script,
    File,
}

/// Catalogue record of a content-addressed artifact. Equal `sha256` means
/// byte-identical content whatever the URL or filename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub scan_id: ScanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub headers: Value,
    pub sha256: String,
}

/// Sighting metadata supplied alongside content when it is offered to the
/// store.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactMetadata {
    pub scan_id: ScanId,
    pub kind: ArtifactKind,
    pub url: String,
    pub filename: String,
    pub headers: Value,
}

impl ArtifactMetadata {
    pub fn new(scan_id: ScanId, kind: ArtifactKind, url: impl Into<String>) -> Self {
        let url = url.into();
        let filename = filename_from_url(&url);
        Self {
            scan_id,
            kind,
            url,
            filename,
            headers: Value::Null,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        if !filename.trim().is_empty() {
            self.filename = filename;
        }
        self
    }

    pub fn with_headers(mut self, headers: Value) -> Self {
        self.headers = headers;
        self
    }
}

/// Unit of scheduled work handed over by the job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanQueueJob {
    pub name: String,
    pub scan_id: ScanId,
    pub source_id: String,
    #[serde(default)]
    pub test: bool,
}

impl ScanQueueJob {
    pub fn new(name: impl Into<String>, source_id: impl Into<String>, test: bool) -> Self {
        Self {
            name: name.into(),
            scan_id: ScanId::new(),
            source_id: source_id.into(),
            test,
        }
    }
}

/// Last non-empty path segment of a URL, or the raw input when it does not
/// parse.
pub fn filename_from_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(url) => url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
            .map(str::to_string)
            .unwrap_or_else(|| url.host_str().unwrap_or_default().to_string()),
        Err(_) => raw.rsplit('/').next().unwrap_or_default().to_string(),
    }
}

//! Manifest files and the pluggable parsers that read them.
//!
//! A manifest names one unit of work: a device, the case it belongs to, and
//! the data source to ingest. Parsers are registered with the monitor; the
//! scanner hands each candidate path to the first parser whose predicate
//! claims it.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestParseError {
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed manifest {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// One unit of work, immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub device_id: String,
    pub case_name: String,
    /// Path of the manifest file itself; doubles as the job's identity and
    /// its coordination node path.
    pub file_path: PathBuf,
    pub data_source_path: PathBuf,
    pub date_created: DateTime<Utc>,
}

impl Manifest {
    /// File name portion of the data source path, for log entries.
    pub fn data_source_file_name(&self) -> String {
        self.data_source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A manifest file parser plugin.
///
/// `file_is_manifest` is a cheap predicate (typically a file-name check);
/// `parse` may still fail on a predicate match, which the scanner treats as
/// a per-file error rather than a scan failure.
pub trait ManifestParser: Send + Sync {
    fn file_is_manifest(&self, path: &Path) -> bool;

    fn parse(&self, path: &Path) -> Result<Manifest, ManifestParseError>;
}

/// The built-in parser: JSON files named `*_manifest.json`.
#[derive(Debug, Default)]
pub struct JsonManifestParser;

#[derive(Deserialize)]
struct JsonManifest {
    device_id: String,
    case_name: String,
    data_source_path: PathBuf,
    #[serde(default)]
    date_created: Option<DateTime<Utc>>,
}

impl ManifestParser for JsonManifestParser {
    fn file_is_manifest(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with("_manifest.json"))
            .unwrap_or(false)
    }

    fn parse(&self, path: &Path) -> Result<Manifest, ManifestParseError> {
        let contents = fs::read_to_string(path).map_err(|source| ManifestParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: JsonManifest =
            serde_json::from_str(&contents).map_err(|e| ManifestParseError::Malformed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if raw.case_name.is_empty() {
            return Err(ManifestParseError::Malformed {
                path: path.to_path_buf(),
                reason: "empty case name".to_string(),
            });
        }

        // Fall back to the file's modification time when the manifest does
        // not carry its own creation date.
        let date_created = match raw.date_created {
            Some(date) => date,
            None => fs::metadata(path)
                .and_then(|m| m.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now()),
        };

        Ok(Manifest {
            device_id: raw.device_id,
            case_name: raw.case_name,
            file_path: path.to_path_buf(),
            data_source_path: raw.data_source_path,
            date_created,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicate_matches_manifest_suffix() {
        let parser = JsonManifestParser;
        assert!(parser.file_is_manifest(Path::new("/input/CaseA/img1_manifest.json")));
        assert!(!parser.file_is_manifest(Path::new("/input/CaseA/img1.dd")));
        assert!(!parser.file_is_manifest(Path::new("/input/CaseA/manifest.xml")));
    }

    #[test]
    fn test_parse_valid_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img1_manifest.json");
        std::fs::write(
            &path,
            r#"{"device_id":"dev-7","case_name":"CaseA","data_source_path":"/input/CaseA/img1.dd"}"#,
        )
        .unwrap();

        let manifest = JsonManifestParser.parse(&path).unwrap();
        assert_eq!(manifest.device_id, "dev-7");
        assert_eq!(manifest.case_name, "CaseA");
        assert_eq!(manifest.file_path, path);
        assert_eq!(manifest.data_source_file_name(), "img1.dd");
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad_manifest.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            JsonManifestParser.parse(&path),
            Err(ManifestParseError::Malformed { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_empty_case_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty_manifest.json");
        std::fs::write(
            &path,
            r#"{"device_id":"d","case_name":"","data_source_path":"/x.dd"}"#,
        )
        .unwrap();

        assert!(matches!(
            JsonManifestParser.parse(&path),
            Err(ManifestParseError::Malformed { .. })
        ));
    }
}

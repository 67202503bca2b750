//! Versioned binary codec for the job record stored at a manifest's
//! coordination service node.
//!
//! The layout is append-only across versions so that a version-N reader can
//! decode any payload written at version <= N, synthesizing defaults for
//! fields the payload predates. A zero-length payload is not an error: it
//! decodes to a fresh PENDING record with `was_set() == false`, making "node
//! exists with no data" and "node never existed" equivalent.

use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::Manifest;

/// Highest node data version this build can decode.
pub const CURRENT_VERSION: u32 = 1;

/// Default priority for newly discovered jobs.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Allocation bound for an encoded record. Sum of the fixed fields plus the
/// maximum lengths the string length prefixes allow.
pub const MAX_NODE_DATA_SIZE: usize = 131_493;

#[derive(Error, Debug)]
pub enum NodeDataError {
    #[error("Node data version {version} is not supported (max {max})")]
    UnsupportedVersion { version: u32, max: u32 },

    #[error("Node data is incomplete: expected {needed} more byte(s) for {field}")]
    Truncated { field: &'static str, needed: usize },

    #[error("Unknown processing status {0}")]
    InvalidStatus(i32),

    #[error("Unknown processing stage {0}")]
    InvalidStage(u8),

    #[error("Timestamp {millis} for {field} is out of range")]
    InvalidTimestamp { field: &'static str, millis: i64 },

    #[error("{field} is {len} bytes, exceeding the {max}-byte length prefix bound")]
    StringTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Encoded record would be {0} bytes, exceeding the maximum of {MAX_NODE_DATA_SIZE}")]
    RecordTooLarge(usize),
}

/// Processing status of the job for a manifest, as persisted in the
/// coordination store. This is the cluster-wide state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Deleted,
}

impl ProcessingStatus {
    fn from_wire(value: i32) -> Result<Self, NodeDataError> {
        match value {
            0 => Ok(ProcessingStatus::Pending),
            1 => Ok(ProcessingStatus::Processing),
            2 => Ok(ProcessingStatus::Completed),
            3 => Ok(ProcessingStatus::Deleted),
            other => Err(NodeDataError::InvalidStatus(other)),
        }
    }

    fn to_wire(self) -> i32 {
        match self {
            ProcessingStatus::Pending => 0,
            ProcessingStatus::Processing => 1,
            ProcessingStatus::Completed => 2,
            ProcessingStatus::Deleted => 3,
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStatus::Pending => write!(f, "pending"),
            ProcessingStatus::Processing => write!(f, "processing"),
            ProcessingStatus::Completed => write!(f, "completed"),
            ProcessingStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// Human-readable progress stage of a job. Unlike [`ProcessingStatus`] this
/// is advisory display state, refreshed by status events and node data
/// updates while a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingStage {
    Pending,
    Starting,
    UpdatingSharedConfig,
    CheckingServices,
    OpeningCase,
    IdentifyingDataSource,
    AddingDataSource,
    AnalyzingDataSource,
    AnalyzingFiles,
    ExportingFiles,
    CancelingModule,
    Canceling,
    Completed,
}

impl ProcessingStage {
    pub fn display_text(self) -> &'static str {
        match self {
            ProcessingStage::Pending => "Pending",
            ProcessingStage::Starting => "Starting",
            ProcessingStage::UpdatingSharedConfig => "Updating shared configuration",
            ProcessingStage::CheckingServices => "Checking services",
            ProcessingStage::OpeningCase => "Opening case",
            ProcessingStage::IdentifyingDataSource => "Identifying data source type",
            ProcessingStage::AddingDataSource => "Adding data source",
            ProcessingStage::AnalyzingDataSource => "Analyzing data source",
            ProcessingStage::AnalyzingFiles => "Analyzing files",
            ProcessingStage::ExportingFiles => "Exporting files",
            ProcessingStage::CancelingModule => "Canceling module",
            ProcessingStage::Canceling => "Canceling",
            ProcessingStage::Completed => "Completed",
        }
    }

    fn from_wire(value: u8) -> Result<Self, NodeDataError> {
        match value {
            0 => Ok(ProcessingStage::Pending),
            1 => Ok(ProcessingStage::Starting),
            2 => Ok(ProcessingStage::UpdatingSharedConfig),
            3 => Ok(ProcessingStage::CheckingServices),
            4 => Ok(ProcessingStage::OpeningCase),
            5 => Ok(ProcessingStage::IdentifyingDataSource),
            6 => Ok(ProcessingStage::AddingDataSource),
            7 => Ok(ProcessingStage::AnalyzingDataSource),
            8 => Ok(ProcessingStage::AnalyzingFiles),
            9 => Ok(ProcessingStage::ExportingFiles),
            10 => Ok(ProcessingStage::CancelingModule),
            11 => Ok(ProcessingStage::Canceling),
            12 => Ok(ProcessingStage::Completed),
            other => Err(NodeDataError::InvalidStage(other)),
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            ProcessingStage::Pending => 0,
            ProcessingStage::Starting => 1,
            ProcessingStage::UpdatingSharedConfig => 2,
            ProcessingStage::CheckingServices => 3,
            ProcessingStage::OpeningCase => 4,
            ProcessingStage::IdentifyingDataSource => 5,
            ProcessingStage::AddingDataSource => 6,
            ProcessingStage::AnalyzingDataSource => 7,
            ProcessingStage::AnalyzingFiles => 8,
            ProcessingStage::ExportingFiles => 9,
            ProcessingStage::CancelingModule => 10,
            ProcessingStage::Canceling => 11,
            ProcessingStage::Completed => 12,
        }
    }
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.display_text())
    }
}

/// The durable job record for one manifest.
///
/// Version 0 carries only the status header; version 1 adds the manifest
/// identity fields and the running-job display fields (stage, stage start,
/// processing host) so dashboards can populate without waiting for a status
/// event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNodeData {
    pub status: ProcessingStatus,
    pub priority: i32,
    pub number_of_crashes: i32,
    /// `None` means the job has not completed.
    pub completed_date: Option<DateTime<Utc>>,
    pub errors_occurred: bool,

    pub version: u32,
    pub device_id: String,
    pub case_name: String,
    /// Empty until the case directory has been created.
    pub case_directory_path: String,
    pub manifest_file_date: Option<DateTime<Utc>>,
    pub manifest_file_path: String,
    pub data_source_path: String,
    pub processing_stage: ProcessingStage,
    pub processing_stage_start_date: Option<DateTime<Utc>>,
    /// Empty when the job is not currently being processed.
    pub processing_host: String,

    was_set: bool,
}

impl Default for JobNodeData {
    fn default() -> Self {
        Self {
            status: ProcessingStatus::Pending,
            priority: DEFAULT_PRIORITY,
            number_of_crashes: 0,
            completed_date: None,
            errors_occurred: false,
            version: 0,
            device_id: String::new(),
            case_name: String::new(),
            case_directory_path: String::new(),
            manifest_file_date: None,
            manifest_file_path: String::new(),
            data_source_path: String::new(),
            processing_stage: ProcessingStage::Pending,
            processing_stage_start_date: None,
            processing_host: String::new(),
            was_set: false,
        }
    }
}

impl JobNodeData {
    /// Builds a current-version record from a manifest and the given state.
    pub fn new(
        manifest: &Manifest,
        status: ProcessingStatus,
        priority: i32,
        number_of_crashes: i32,
        completed_date: Option<DateTime<Utc>>,
        errors_occurred: bool,
    ) -> Self {
        Self {
            status,
            priority,
            number_of_crashes,
            completed_date,
            errors_occurred,
            version: CURRENT_VERSION,
            device_id: manifest.device_id.clone(),
            case_name: manifest.case_name.clone(),
            case_directory_path: String::new(),
            manifest_file_date: Some(manifest.date_created),
            manifest_file_path: manifest.file_path.display().to_string(),
            data_source_path: manifest.data_source_path.display().to_string(),
            processing_stage: ProcessingStage::Pending,
            processing_stage_start_date: None,
            processing_host: String::new(),
            was_set: false,
        }
    }

    /// Whether this record was decoded from a non-empty coordination node
    /// payload. `false` means the node has never been claimed.
    pub fn was_set(&self) -> bool {
        self.was_set
    }

    /// Upgrades a version-0 record in place, filling the version-1 fields
    /// from the manifest so the next write persists them.
    pub fn upgrade(&mut self, manifest: &Manifest, host_name: &str, stage: ProcessingStage) {
        if self.version >= CURRENT_VERSION {
            return;
        }
        self.version = CURRENT_VERSION;
        self.device_id = manifest.device_id.clone();
        self.case_name = manifest.case_name.clone();
        self.manifest_file_date = Some(manifest.date_created);
        self.manifest_file_path = manifest.file_path.display().to_string();
        self.data_source_path = manifest.data_source_path.display().to_string();
        self.processing_stage = stage;
        self.processing_stage_start_date = Some(manifest.date_created);
        self.processing_host = host_name.to_string();
    }

    /// Decodes a record from raw coordination node bytes.
    ///
    /// An empty buffer yields the default record with `was_set() == false`.
    /// A buffer whose version exceeds [`CURRENT_VERSION`] is rejected.
    pub fn decode(raw: &[u8]) -> Result<Self, NodeDataError> {
        let mut data = Self::default();
        let mut buf = raw;

        if !buf.has_remaining() {
            return Ok(data);
        }
        data.was_set = true;

        data.status = ProcessingStatus::from_wire(get_i32(&mut buf, "status")?)?;
        data.priority = get_i32(&mut buf, "priority")?;
        data.number_of_crashes = get_i32(&mut buf, "numberOfCrashes")?;
        data.completed_date = get_optional_date(&mut buf, "completedDate")?;
        data.errors_occurred = get_i32(&mut buf, "errorsOccurred")? == 1;

        if !buf.has_remaining() {
            // Header-only payload: a version 0 writer produced it.
            return Ok(data);
        }

        let version = get_i32(&mut buf, "version")? as u32;
        if version > CURRENT_VERSION {
            return Err(NodeDataError::UnsupportedVersion {
                version,
                max: CURRENT_VERSION,
            });
        }
        data.version = version;
        data.device_id = get_string_u8(&mut buf, "deviceId")?;
        data.case_name = get_string_u8(&mut buf, "caseName")?;
        data.case_directory_path = get_string_u16(&mut buf, "caseDirectoryPath")?;
        data.manifest_file_date = get_optional_date(&mut buf, "manifestFileDate")?;
        data.manifest_file_path = get_string_u16(&mut buf, "manifestFilePath")?;
        data.data_source_path = get_string_u16(&mut buf, "dataSourcePath")?;
        data.processing_stage = ProcessingStage::from_wire(get_u8(&mut buf, "processingStage")?)?;
        data.processing_stage_start_date = get_optional_date(&mut buf, "processingStageStartDate")?;
        data.processing_host = get_string_u16(&mut buf, "processingHost")?;

        Ok(data)
    }

    /// Encodes the record for storage at the coordination node.
    ///
    /// The version-1 section is written only for records at version >= 1, so
    /// a record decoded from a version-0 payload re-encodes byte-identically.
    pub fn encode(&self) -> Result<Vec<u8>, NodeDataError> {
        let mut buf = BytesMut::with_capacity(256);

        buf.put_i32(self.status.to_wire());
        buf.put_i32(self.priority);
        buf.put_i32(self.number_of_crashes);
        buf.put_i64(millis_or_zero(self.completed_date));
        buf.put_i32(if self.errors_occurred { 1 } else { 0 });

        if self.version >= 1 {
            buf.put_i32(self.version as i32);
            put_string_u8(&mut buf, "deviceId", &self.device_id)?;
            put_string_u8(&mut buf, "caseName", &self.case_name)?;
            put_string_u16(&mut buf, "caseDirectoryPath", &self.case_directory_path)?;
            buf.put_i64(millis_or_zero(self.manifest_file_date));
            put_string_u16(&mut buf, "manifestFilePath", &self.manifest_file_path)?;
            put_string_u16(&mut buf, "dataSourcePath", &self.data_source_path)?;
            buf.put_u8(self.processing_stage.to_wire());
            buf.put_i64(millis_or_zero(self.processing_stage_start_date));
            put_string_u16(&mut buf, "processingHost", &self.processing_host)?;
        }

        if buf.len() > MAX_NODE_DATA_SIZE {
            return Err(NodeDataError::RecordTooLarge(buf.len()));
        }
        Ok(buf.to_vec())
    }
}

fn millis_or_zero(date: Option<DateTime<Utc>>) -> i64 {
    date.map(|d| d.timestamp_millis()).unwrap_or(0)
}

fn get_i32(buf: &mut &[u8], field: &'static str) -> Result<i32, NodeDataError> {
    if buf.remaining() < 4 {
        return Err(NodeDataError::Truncated {
            field,
            needed: 4 - buf.remaining(),
        });
    }
    Ok(buf.get_i32())
}

fn get_i64(buf: &mut &[u8], field: &'static str) -> Result<i64, NodeDataError> {
    if buf.remaining() < 8 {
        return Err(NodeDataError::Truncated {
            field,
            needed: 8 - buf.remaining(),
        });
    }
    Ok(buf.get_i64())
}

fn get_u8(buf: &mut &[u8], field: &'static str) -> Result<u8, NodeDataError> {
    if !buf.has_remaining() {
        return Err(NodeDataError::Truncated { field, needed: 1 });
    }
    Ok(buf.get_u8())
}

/// Reads an epoch-millis timestamp where 0 means unset.
fn get_optional_date(
    buf: &mut &[u8],
    field: &'static str,
) -> Result<Option<DateTime<Utc>>, NodeDataError> {
    let millis = get_i64(buf, field)?;
    if millis == 0 {
        return Ok(None);
    }
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(Some)
        .ok_or(NodeDataError::InvalidTimestamp { field, millis })
}

fn get_bytes(buf: &mut &[u8], field: &'static str, len: usize) -> Result<String, NodeDataError> {
    if buf.remaining() < len {
        return Err(NodeDataError::Truncated {
            field,
            needed: len - buf.remaining(),
        });
    }
    let s = String::from_utf8_lossy(&buf[..len]).into_owned();
    buf.advance(len);
    Ok(s)
}

fn get_string_u8(buf: &mut &[u8], field: &'static str) -> Result<String, NodeDataError> {
    let len = get_u8(buf, field)? as usize;
    get_bytes(buf, field, len)
}

fn get_string_u16(buf: &mut &[u8], field: &'static str) -> Result<String, NodeDataError> {
    if buf.remaining() < 2 {
        return Err(NodeDataError::Truncated {
            field,
            needed: 2 - buf.remaining(),
        });
    }
    let len = buf.get_u16() as usize;
    get_bytes(buf, field, len)
}

fn put_string_u8(buf: &mut BytesMut, field: &'static str, value: &str) -> Result<(), NodeDataError> {
    if value.len() > u8::MAX as usize {
        return Err(NodeDataError::StringTooLong {
            field,
            len: value.len(),
            max: u8::MAX as usize,
        });
    }
    buf.put_u8(value.len() as u8);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_string_u16(
    buf: &mut BytesMut,
    field: &'static str,
    value: &str,
) -> Result<(), NodeDataError> {
    if value.len() > u16::MAX as usize {
        return Err(NodeDataError::StringTooLong {
            field,
            len: value.len(),
            max: u16::MAX as usize,
        });
    }
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

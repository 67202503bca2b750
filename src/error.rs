use thiserror::Error;

use crate::coordination::CoordinationError;
use crate::manifest::ManifestParseError;
use crate::node_data::NodeDataError;

#[derive(Error, Debug)]
pub enum AutoIngestError {
    #[error("Coordination service error: {0}")]
    Coordination(#[from] CoordinationError),

    #[error("Invalid node data: {0}")]
    NodeData(#[from] NodeDataError),

    #[error("Manifest parse error: {0}")]
    ManifestParse(#[from] ManifestParseError),

    #[error("Monitor is not running")]
    NotRunning,

    #[error("No job is currently being processed")]
    NoCurrentJob,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AutoIngestError>;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Failed to read host list {path}: {source}")]
    SourceUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("No valid targets found in {0}")]
    NoValidTargets(String),
    #[error("A result for host '{0}' was already recorded")]
    DuplicateResult(String),
    #[error("Failed to render command template: {0}")]
    Template(String),
    #[error("Failed to write {path}: {source}")]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to encode report: {0}")]
    ReportEncode(String),
}

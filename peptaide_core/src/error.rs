//! Error types for the peptaide_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for peptaide_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Free-text dose could not be parsed into a quantity
    #[error("Parse error: {0}")]
    Parse(String),

    /// Unit not recognized by the canonicalizer
    #[error("Unit error: {0}")]
    Unit(String),

    /// Device-unit input with no resolvable calibration
    #[error("Calibration missing: {0}")]
    CalibrationMissing(String),

    /// Malformed distribution parameters
    #[error("Distribution error: {0}")]
    Distribution(String),

    /// Invalid dose computation input
    #[error("Dose error: {0}")]
    Dose(String),

    /// Invalid Monte Carlo input (sample count, dose)
    #[error("Simulation error: {0}")]
    Simulation(String),

    /// Cycle rule or cycle transition error
    #[error("Cycle error: {0}")]
    Cycle(String),

    /// Unique-active-cycle or cycle-number race lost against another writer
    #[error("Storage conflict: {0}")]
    StorageConflict(String),

    /// A storage lock could not be acquired before the caller's deadline
    #[error("Storage timeout: {0}")]
    StorageTimeout(String),

    /// Referenced entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Historical import error
    #[error("Import error: {0}")]
    Import(String),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reference catalog validation error
    #[error("Catalog validation error: {0}")]
    CatalogValidation(String),
}

impl Error {
    /// Whether this error leaves a single compartment unsimulated instead of
    /// aborting the whole event.
    pub fn is_fail_closed(&self) -> bool {
        matches!(self, Error::Distribution(_))
    }
}

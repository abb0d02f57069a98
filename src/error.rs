//! Unified error handling for the street-coverage library.
//!
//! Most coverage operations are infallible: noisy fixes and degenerate
//! streets are expected input and surface as no-op outcomes, not errors.
//! This type covers the remaining fallible seams: configuration, storage
//! and lookups by way id.

use std::fmt;

/// Unified error type for street-coverage operations.
#[derive(Debug, Clone)]
pub enum CoverageError {
    /// Street has too few vertices to be projected or sampled
    InsufficientPoints {
        way_id: i64,
        point_count: usize,
        minimum_required: usize,
    },
    /// Coordinates outside WGS84 range or non-finite
    InvalidCoordinates { message: String },
    /// No street with this way id in the loaded dataset
    UnknownStreet { way_id: i64 },
    /// Persistence/storage error
    PersistenceError { message: String },
    /// Configuration error
    ConfigError { message: String },
}

impl fmt::Display for CoverageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoverageError::InsufficientPoints {
                way_id,
                point_count,
                minimum_required,
            } => {
                write!(
                    f,
                    "Way {} has {} points, minimum {} required",
                    way_id, point_count, minimum_required
                )
            }
            CoverageError::InvalidCoordinates { message } => {
                write!(f, "Invalid coordinates: {}", message)
            }
            CoverageError::UnknownStreet { way_id } => {
                write!(f, "Way {} is not in the loaded dataset", way_id)
            }
            CoverageError::PersistenceError { message } => {
                write!(f, "Persistence error: {}", message)
            }
            CoverageError::ConfigError { message } => {
                write!(f, "Configuration error: {}", message)
            }
        }
    }
}

impl std::error::Error for CoverageError {}

#[cfg(feature = "persistence")]
impl From<rusqlite::Error> for CoverageError {
    fn from(err: rusqlite::Error) -> Self {
        CoverageError::PersistenceError {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::encode::Error> for CoverageError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CoverageError::PersistenceError {
            message: format!("encode: {}", err),
        }
    }
}

#[cfg(feature = "persistence")]
impl From<rmp_serde::decode::Error> for CoverageError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        CoverageError::PersistenceError {
            message: format!("decode: {}", err),
        }
    }
}

/// Result type alias for street-coverage operations.
pub type Result<T> = std::result::Result<T, CoverageError>;

/// Extension trait for converting Option to CoverageError.
pub trait OptionExt<T> {
    /// Convert Option to Result with unknown street error.
    fn ok_or_unknown_street(self, way_id: i64) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_unknown_street(self, way_id: i64) -> Result<T> {
        self.ok_or(CoverageError::UnknownStreet { way_id })
    }
}

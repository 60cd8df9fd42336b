use ulid::Ulid;

use crate::catalog::CatalogError;
use crate::model::{CivilDate, ClockTime, FormatError};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),
    #[error("{staff} is not available on {date} at {time}")]
    Conflict {
        staff: String,
        date: CivilDate,
        time: ClockTime,
    },
    #[error("appointment not found: {0}")]
    NotFound(Ulid),
    #[error("appointment {0} belongs to another location")]
    Forbidden(Ulid),
    #[error("store error: {0}")]
    Store(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "invalid",
            EngineError::Conflict { .. } => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::Store(_) | EngineError::Config(_) => "error",
        }
    }
}

impl From<FormatError> for EngineError {
    fn from(e: FormatError) -> Self {
        EngineError::Validation(e.to_string())
    }
}

impl From<CatalogError> for EngineError {
    fn from(e: CatalogError) -> Self {
        match &e {
            CatalogError::EmptySelection => EngineError::Validation("at least one service is required".into()),
            CatalogError::SelectionTooLong => EngineError::Validation(e.to_string()),
            _ => EngineError::Config(e.to_string()),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate(slot) => EngineError::Conflict {
                staff: slot.staff_id,
                date: slot.date,
                time: slot.time,
            },
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::Io(e) => EngineError::Store(e.to_string()),
        }
    }
}

use thiserror::Error;

use crate::document::RowId;
use crate::plan::PlanId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported stage: {0}")]
    UnsupportedStage(String),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("invalid $lookup: {0}")]
    InvalidLookup(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    #[error("row not found: {0}")]
    RowNotFound(RowId),

    #[error("plan not found: {0}")]
    PlanNotFound(PlanId),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("document must be a JSON object")]
    NotAnObject,
}

pub type Result<T> = std::result::Result<T, Error>;

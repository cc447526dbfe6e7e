use thiserror::Error;

use crate::types::LimitDecision;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation limit reached")]
    LimitReached { decision: LimitDecision },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// crates/daemon/src/maintenance/mod.rs
//! Scheduled maintenance jobs: reanalysis enqueue, connection discovery,
//! pattern aggregation, clustering, embedding backfill, effectiveness
//! measurement and insight auto-disable.

pub mod aggregation;
pub mod backfill;
pub mod clustering;
pub mod connections;
pub mod effectiveness;
pub mod reanalysis;
#[cfg(test)]
pub(crate) mod test_support;

use crate::embedder::EmbedError;
use pi_brain_db::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Embed(#[from] EmbedError),

    #[error("{0}")]
    Other(String),
}

pub type MaintenanceResult<T> = Result<T, MaintenanceError>;

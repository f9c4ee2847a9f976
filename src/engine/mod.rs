//! The two execution engines and the pieces they share.
//!
//! The pipeline engine drives stages and steps; the deployment orchestrator
//! drives one release through its state machine. Pipelines reach the cluster
//! only through the orchestrator's strategy executor.

pub mod artifact;
pub mod condition;
pub mod deployment;
pub mod health;
pub mod pipeline;
pub mod quality_monitor;
pub mod retry;
pub mod steps;
pub mod strategy;

pub use deployment::{DeploymentOptions, DeploymentOrchestrator};
pub use pipeline::PipelineEngine;

use thiserror::Error;

use crate::db::DeploymentStatus;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    #[error("Deployment {0} has no previous version to roll back to")]
    NoPreviousVersion(String),

    #[error("{kind} {id} cannot be cancelled in state {state}")]
    NotCancellable {
        kind: &'static str,
        id: String,
        state: String,
    },

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: DeploymentStatus,
        to: DeploymentStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Adapter(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn invalid(problem: impl Into<String>) -> Self {
        Self::InvalidConfig(vec![problem.into()])
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

//! Controller-specific error types.
//!
//! This module defines error types specific to the Special Resource Controller
//! that are not covered by upstream library errors.

use helmer::HelmerError;
use kube::Error as KubeError;
use thiserror::Error;

use crate::cluster::ClusterError;

/// Terminal outcomes of a status write that lost an optimistic-concurrency race
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusUpdateError {
    /// The resource disappeared before or while the status was written
    #[error("SpecialResource {0} not found. Is the SpecialResource being deleted?")]
    NotFound(String),

    /// The resource is being deleted; the write is abandoned without retry
    #[error("SpecialResource {0} is marked for deletion")]
    MarkedForDeletion(String),

    /// The refetched resource still exists but the write conflicted
    #[error("conflicting status update for SpecialResource {0}")]
    Conflict(String),
}

/// Errors that can occur in the Special Resource Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Cluster access error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Chart loading or apply error
    #[error("Helmer error: {0}")]
    Helmer(#[from] HelmerError),

    /// No node matching the selector reported a kernel version
    #[error("no kernel version detected")]
    NoKernelVersion,

    /// The last kernel replica of a state failed to apply
    #[error("failed to apply state {state}: {source}")]
    StateFailed {
        state: String,
        #[source]
        source: HelmerError,
    },

    /// Status write failed
    #[error("Status update failed: {0}")]
    StatusUpdate(#[from] StatusUpdateError),

    /// RBAC denied a bootstrap call
    #[error("forbidden - check Role, ClusterRole and Bindings for operator: {0}")]
    Forbidden(String),

    /// Resource is missing something the controller requires
    #[error("Invalid resource: {0}")]
    InvalidResource(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Value (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

use uuid::Uuid;

/// Errors that can occur while enqueueing a job on the broker.
///
/// Broker unavailability is deliberately distinct from "the job itself
/// failed": callers that cannot enqueue must not record a job failure.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// An error occurred while serializing the job data.
    #[error("Failed to serialize job data: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An error occurred while interacting with the database.
    #[error("Queue broker unavailable: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors from Job Store state machine operations.
#[derive(Debug, thiserror::Error)]
pub enum JobStoreError {
    /// Another continuous job is already running for this config.
    #[error("config {0} already has a running continuous job")]
    AlreadyRunning(Uuid),

    /// The requested job does not exist or is already terminal.
    #[error("aggregation job {0} not found or already terminal")]
    NotFound(Uuid),

    /// An error occurred while interacting with the database.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Errors that can occur while starting or stopping an aggregation job.
#[derive(Debug, thiserror::Error)]
pub enum StartJobError {
    /// The Job Store rejected the transition.
    #[error(transparent)]
    Store(#[from] JobStoreError),

    /// The job row was created but the broker could not be reached. The
    /// row is cancelled before this is returned, so callers can tell broker
    /// unavailability apart from a logical job failure.
    #[error(transparent)]
    Enqueue(#[from] EnqueueError),
}

/// Errors from the Quota Gate.
#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    /// The tenant's tier does not permit the requested action.
    #[error("quota denied: {reason}")]
    Denied {
        /// Human-readable denial reason, suitable for tenant-facing UIs.
        reason: String,
    },

    /// The tenant or config row does not exist.
    #[error("tenant or config {0} not found")]
    NotFound(Uuid),

    /// An error occurred while interacting with the database.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

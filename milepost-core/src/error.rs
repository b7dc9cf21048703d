//! Error types for Milepost operations.

use thiserror::Error;

/// Stable taxonomy of error kinds, independent of the message text.
///
/// Every [`MilepostError`] maps to exactly one kind via [`MilepostError::kind`];
/// callers that need to branch on failure class should match on this instead
/// of parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotConfigured,
    InvalidConfig,
    LocationUnreadable,
    InvalidVersion,
    InvalidDescription,
    DuplicateMigration,
    NonEmptyNoMetadata,
    AlreadyBaselined,
    NonEmptyHistory,
    ValidationFailed,
    ChecksumMismatch,
    MissingAppliedScript,
    FutureMigration,
    MigrationFailed,
    CleanDisabled,
    LockTimeout,
    BackendError,
}

/// All error types that Milepost operations can produce.
#[derive(Error, Debug)]
pub enum MilepostError {
    #[error("No backend configured. Attach a backend or a backend factory before running commands.")]
    NotConfigured,

    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    #[error("Location '{location}' is unreadable: {reason}")]
    LocationUnreadable { location: String, reason: String },

    #[error("Invalid migration version: {0}")]
    InvalidVersion(String),

    #[error("Invalid migration description: {0}")]
    InvalidDescription(String),

    #[error("Duplicate migration {identity}: found in '{first}' and '{second}'")]
    DuplicateMigration {
        identity: String,
        first: String,
        second: String,
    },

    #[error("Found a non-empty database without a metadata collection. Run baseline, or enable baseline_on_migrate, to initialize the history first.")]
    NonEmptyNoMetadata,

    #[error("A baseline marker is already present in the metadata collection.")]
    AlreadyBaselined,

    #[error("The metadata collection already records applied migrations; refusing to add a marker.")]
    NonEmptyHistory,

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Checksum mismatch for migration {script}: stored {stored}, resolved {resolved}. The script was modified after it was applied.")]
    ChecksumMismatch {
        script: String,
        stored: i32,
        resolved: i32,
    },

    #[error("Applied migration {0} is no longer resolvable from the configured locations")]
    MissingAppliedScript(String),

    #[error("Applied migration version {version} is newer than the highest resolved version {highest}")]
    FutureMigration { version: String, highest: String },

    #[error("Migration {script} failed after {applied} successful application(s): {reason}")]
    MigrationFailed {
        script: String,
        reason: String,
        applied: usize,
    },

    #[error("Clean is disabled (clean_disabled = true).")]
    CleanDisabled,

    #[error("Gave up acquiring the metadata lock after {waited_ms} ms")]
    LockTimeout { waited_ms: u64 },

    #[error("Callback {callback} failed during {event}: {reason}")]
    CallbackFailed {
        callback: String,
        event: String,
        reason: String,
    },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MilepostError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MilepostError::NotConfigured => ErrorKind::NotConfigured,
            MilepostError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            MilepostError::LocationUnreadable { .. } => ErrorKind::LocationUnreadable,
            MilepostError::InvalidVersion(_) => ErrorKind::InvalidVersion,
            MilepostError::InvalidDescription(_) => ErrorKind::InvalidDescription,
            MilepostError::DuplicateMigration { .. } => ErrorKind::DuplicateMigration,
            MilepostError::NonEmptyNoMetadata => ErrorKind::NonEmptyNoMetadata,
            MilepostError::AlreadyBaselined => ErrorKind::AlreadyBaselined,
            MilepostError::NonEmptyHistory => ErrorKind::NonEmptyHistory,
            MilepostError::ValidationFailed(_) => ErrorKind::ValidationFailed,
            MilepostError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            MilepostError::MissingAppliedScript(_) => ErrorKind::MissingAppliedScript,
            MilepostError::FutureMigration { .. } => ErrorKind::FutureMigration,
            MilepostError::MigrationFailed { .. } => ErrorKind::MigrationFailed,
            MilepostError::CleanDisabled => ErrorKind::CleanDisabled,
            MilepostError::LockTimeout { .. } => ErrorKind::LockTimeout,
            MilepostError::CallbackFailed { .. } => ErrorKind::BackendError,
            MilepostError::Backend(_) => ErrorKind::BackendError,
            MilepostError::Io(_) => ErrorKind::BackendError,
        }
    }
}

pub type Result<T> = std::result::Result<T, MilepostError>;

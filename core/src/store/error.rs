/// What the store reported went wrong, as far as it can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    UniqueViolation,
    /// Timeouts, dropped connections, deadlocks and lock waits.
    Transient,
    Other,
}

/// How the batch engine treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Fatal,
    Retryable,
    PerItemFailure,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StoreError {
    pub kind: StoreErrorKind,
    pub message: String,
}

const UNIQUE_VIOLATION_MARKERS: &[&str] = &[
    "unique constraint",
    "duplicate key",
    "duplicate entry",
    "e11000",
    "violation of unique key",
    "violation of primary key",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "deadlock",
    "lock wait",
    "could not serialize",
    "too many clients",
];

impl StoreError {
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn unique_violation(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::UniqueViolation, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Transient, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Other, message)
    }

    /// Classifies an error from its message alone. Only for stores that cannot
    /// report a structured error code.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();

        let kind = if UNIQUE_VIOLATION_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            StoreErrorKind::UniqueViolation
        } else if TRANSIENT_MARKERS.iter().any(|marker| lowered.contains(marker)) {
            StoreErrorKind::Transient
        } else {
            StoreErrorKind::Other
        };

        Self { kind, message }
    }

    pub fn class(&self) -> ErrorClass {
        match self.kind {
            StoreErrorKind::UniqueViolation => ErrorClass::PerItemFailure,
            StoreErrorKind::Transient => ErrorClass::Retryable,
            StoreErrorKind::Other => ErrorClass::Fatal,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        self.kind == StoreErrorKind::UniqueViolation
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("transaction conflict: a concurrently committed transaction wrote what this transaction read")]
    Conflict,

    #[error("illegal transaction state: {reason}")]
    IllegalState { reason: String },

    #[error("no transaction is active in this context")]
    NoActiveTransaction,

    #[error("operation requires a read-write transaction: {operation}")]
    ReadOnlyTransaction { operation: String },

    #[error("transaction engine invariant violated: {details}")]
    InvariantViolation { details: String },

    #[error("flush failed earlier, refusing to buffer more changes: {details}")]
    FlushFailed { details: String },

    #[error("cursor is not positioned on a value")]
    InvalidCursorPosition,

    #[error("cursor is closed")]
    CursorClosed,

    #[error("index cursor lock does not match index order: {details}")]
    InvalidIndexLock { details: String },

    #[error("no partition registered for suffix '{dn}'")]
    PartitionNotFound { dn: String },

    #[error("invalid distinguished name '{dn}': {reason}")]
    InvalidDn { dn: String, reason: String },

    #[error("serialization error: {error} ({context})")]
    SerializationError { context: String, error: String },

    #[error("deserialization error: {error} ({context})")]
    DeserializationError { context: String, error: String },

    #[error("lock poisoned: {lock_name} (another thread panicked while holding this lock)")]
    LockPoisoned { lock_name: String },

    #[error("invalid magic number")]
    InvalidMagic,

    #[error("unsupported version")]
    InvalidVersion,

    #[error("WAL file corrupted")]
    WALCorrupted,

    #[error("WAL checksum verification failed")]
    WALChecksumFail,

    #[error("WAL record too large: {size} bytes (limit {limit})")]
    WALRecordTooLarge { size: usize, limit: usize },

    #[error("engine is closed")]
    EngineClosed,

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for the one error a caller is expected to retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict)
    }

    /// True for durability-affecting failures (WAL append, flush).
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::FlushFailed { .. }
                | Error::WALCorrupted
                | Error::WALChecksumFail
                | Error::WALRecordTooLarge { .. }
        )
    }

    pub(crate) fn illegal_state(reason: impl Into<String>) -> Self {
        Error::IllegalState { reason: reason.into() }
    }

    /// Internal invariant breach. Panics in debug builds so the defect is loud.
    pub(crate) fn invariant(details: impl Into<String>) -> Self {
        let details = details.into();
        tracing::error!(%details, "transaction engine invariant violated");
        debug_assert!(false, "transaction engine invariant violated: {}", details);
        Error::InvariantViolation { details }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::DeserializationError {
            context: "json".to_string(),
            error: err.to_string(),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::LockPoisoned {
            lock_name: "unknown".to_string(),
        }
    }
}

// short frame reads surface as corruption of the log file
impl From<std::array::TryFromSliceError> for Error {
    fn from(_: std::array::TryFromSliceError) -> Self {
        Error::WALCorrupted
    }
}

pub trait PoisonedLockExt<'a, T> {
    fn recover_poison(self) -> T;
}

impl<'a, T> PoisonedLockExt<'a, std::sync::RwLockReadGuard<'a, T>> for std::sync::LockResult<std::sync::RwLockReadGuard<'a, T>> {
    fn recover_poison(self) -> std::sync::RwLockReadGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<'a, T> PoisonedLockExt<'a, std::sync::RwLockWriteGuard<'a, T>> for std::sync::LockResult<std::sync::RwLockWriteGuard<'a, T>> {
    fn recover_poison(self) -> std::sync::RwLockWriteGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<'a, T> PoisonedLockExt<'a, std::sync::MutexGuard<'a, T>> for std::sync::LockResult<std::sync::MutexGuard<'a, T>> {
    fn recover_poison(self) -> std::sync::MutexGuard<'a, T> {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::Conflict.is_conflict());
        assert!(!Error::Conflict.is_io());
        assert!(Error::Io("disk full".to_string()).is_io());
        assert!(Error::FlushFailed { details: "boom".to_string() }.is_io());
        assert!(!Error::NoActiveTransaction.is_io());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "device gone");
        let err: Error = io.into();
        assert!(err.is_io());
        assert!(err.to_string().contains("device gone"));
    }

    #[test]
    fn test_recover_poison() {
        let lock = std::sync::Arc::new(std::sync::Mutex::new(5));
        let poisoner = lock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison the lock");
        })
        .join();

        let guard = lock.lock().recover_poison();
        assert_eq!(*guard, 5);
    }
}

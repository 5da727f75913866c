use std::fmt::Display;

/// cinder errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The requested key does not exist.
    NotFound,
    /// Invalid user input: misordered ranges, reuse of a closed iterator,
    /// malformed arguments.
    InvalidArgument(String),
    /// Invalid on-disk data: checksum mismatch, impossible manifest edit,
    /// truncated records. The database is marked read-only when this
    /// surfaces from the write path.
    Corruption(String),
    /// An IO error.
    Io(String),
    /// The sstable carries a format version this build does not understand.
    TableFormatUnsupported(u32),
    /// A write was attempted on a read-only structure (frozen memtable,
    /// finished batch) or on a database latched read-only by a data error.
    ReadOnly,
    /// The memtable arena cannot fit the batch. Internal: the commit
    /// pipeline rotates the memtable and retries, callers never see this.
    MemtableFull,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::TableFormatUnsupported(v) => {
                write!(f, "table format version {v} is not supported")
            }
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::MemtableFull => write!(f, "memtable full"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidArgument for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)).into() };
}

/// A cinder Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corruption(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formats() {
        assert_eq!(Error::NotFound.to_string(), "not found");
        assert_eq!(
            Error::Corruption("bad crc".into()).to_string(),
            "corruption: bad crc"
        );
        assert_eq!(
            Error::TableFormatUnsupported(9).to_string(),
            "table format version 9 is not supported"
        );
    }

    #[test]
    fn macros_produce_results() {
        let r: Result<()> = errinput!("end {} before start {}", "a", "b");
        assert!(matches!(r, Err(Error::InvalidArgument(_))));
        let r: Result<()> = errcorrupt!("checksum mismatch at {}", 7);
        assert!(matches!(r, Err(Error::Corruption(_))));
    }
}

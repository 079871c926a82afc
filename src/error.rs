use thiserror::Error;

/// Errors surfaced by [`crate::SharedTable`] operations.
///
/// `get`, `has`, and traversal never produce these: they complete once the
/// global gate is available, observing a transient empty chain at worst.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("table is full, no free slot available")]
    TableFull,
    #[error("key length {len} exceeds the table's key capacity {cap}")]
    KeyTooLong { len: usize, cap: u32 },
    #[error("value length {len} exceeds the table's value capacity {cap}")]
    ValueTooLong { len: usize, cap: u32 },
    #[error("key must not be empty")]
    InvalidKey,
    #[error("line-lock acquisition exceeded {retries} retries without making progress")]
    Deadlock { retries: u32 },
    #[error("{0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

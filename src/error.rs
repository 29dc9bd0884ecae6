//! Error type for the page store.
//!
//! Mirrors the semantic error codes of the subsystem: an underlying I/O failure, a detected
//! on-disk inconsistency, an unsupported file version, exhaustion of the configured maximum file
//! size, and cache memory that could not be shrunk enough to satisfy an allocation.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data file error: {0}")]
    DataFile(String),
    #[error("wrong database file version")]
    WrongVersion,
    #[error("data file is full: grow past {max_size} bytes was requested")]
    FileFull { max_size: u64 },
    #[error("out of memory: cache could not be shrunk to satisfy the allocation")]
    OutOfMemory,
}

impl Error {
    pub fn data_file(msg: impl Into<String>) -> Self {
        Self::DataFile(msg.into())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from(e))
    }
}

use log::warn;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid FAT volume: {0}")]
    FormatInvalid(String),

    #[error("Volume recorded a hard I/O error, run fsck")]
    HardIoError,

    #[error("Volume was not cleanly unmounted, run fsck")]
    DirtyVolume,

    #[error("Invalid cluster {0}")]
    InvalidCluster(u32),

    #[error("Malformed cluster chain: {0}")]
    MalformedChain(String),

    #[error("No free clusters left on volume")]
    NoSpace,

    #[error("Volume is mounted read-only")]
    ReadOnly,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Entry is in use: {0}")]
    IsActive(String),

    #[error("Not a directory: {0}")]
    NotADir(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Permission denied: {0}")]
    Permission(String),

    #[error("Volume is unmounted")]
    Unmounted,
}

pub type Result<T> = std::result::Result<T, FatError>;

/// Outcome of advisory bookkeeping (mirror FAT writes, FSInfo hints,
/// clean-flag on close).
///
/// The error, if any, is dropped in exactly one place: [`BestEffort::ignore`],
/// which logs it. Callers that want to look at it (tests, diagnostics) can
/// use [`BestEffort::into_result`] instead.
#[must_use = "best-effort results must be explicitly ignored or inspected"]
#[derive(Debug)]
pub struct BestEffort(Result<()>);

impl BestEffort {
    pub fn new(result: Result<()>) -> Self {
        Self(result)
    }

    pub fn is_ok(&self) -> bool {
        self.0.is_ok()
    }

    pub fn into_result(self) -> Result<()> {
        self.0
    }

    /// Discard the error after logging it.
    pub fn ignore(self, what: &str) {
        if let Err(e) = self.0 {
            warn!("{what} failed (ignored): {e}");
        }
    }
}

impl From<Result<()>> for BestEffort {
    fn from(result: Result<()>) -> Self {
        Self(result)
    }
}

//! Error types for collbench
//!
//! Every failure in a benchmark run is unrecoverable: the protocol relies on
//! every rank reaching the same state, so the driver turns any error into a
//! coordinated abort of the whole group (see [`Error::is_group_fatal`]).

use std::path::PathBuf;
use thiserror::Error;

/// Result type for benchmark operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for benchmark operations
#[derive(Error, Debug)]
pub enum Error {
    /// The group has fewer than two participants
    #[error("Need more than one process (group size is {0})")]
    GroupTooSmall(i32),

    /// The messages source could not be read or parsed
    #[error("Configuration error in {path}: {reason}")]
    Config {
        /// Source that failed
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// A row of the messages source has the wrong number of columns
    #[error("Number of columns ({columns}) does not match number of processes ({size}) on row {row}")]
    WidthMismatch {
        /// Zero-based row index
        row: usize,
        /// Columns found
        columns: usize,
        /// Group size
        size: i32,
    },

    /// A requested option is not valid for this run
    #[error("Invalid option: {0}")]
    InvalidOption(String),

    /// A message buffer falls outside the allowed size envelope
    #[error("Message buffer of {bytes} bytes is outside the allowed envelope [{min}, {max}]")]
    Envelope {
        /// Requested size in bytes
        bytes: u64,
        /// Smallest allowed size
        min: u64,
        /// Largest allowed size
        max: u64,
    },

    /// Message buffers could not be allocated
    #[error("Could not allocate {0} bytes for message buffers")]
    Allocation(u64),

    /// Ranks disagree on the number of recorded trials
    #[error("Timing buffers mismatch: rank {rank} ran {found} trials, coordinator ran {expected}")]
    CountMismatch {
        /// First rank that disagrees
        rank: usize,
        /// Trials on that rank
        found: u64,
        /// Trials on the coordinator
        expected: u64,
    },

    /// Start and end sample counts differ on some rank
    #[error("Timing buffers mismatch: rank {rank} has {starts} starts and {ends} ends")]
    SampleMismatch {
        /// Offending rank
        rank: usize,
        /// Start timestamps
        starts: u64,
        /// End timestamps
        ends: u64,
    },

    /// The persister was called before any trial ran
    #[error("Must run first before saving")]
    NoSamples,

    /// A received payload does not match the fill pattern
    #[error("Payload verification failed at element {index} from rank {source_rank}")]
    Verification {
        /// Rank the element originated from
        source_rank: usize,
        /// Index in the receive buffer
        index: usize,
    },

    /// The output record could not be opened or written
    #[error("Unable to write {path}: {source}")]
    Io {
        /// Destination
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Invalid rank specified
    #[error("Invalid rank: {0}")]
    InvalidRank(i32),

    /// Invalid buffer provided
    #[error("Invalid buffer: {0}")]
    InvalidBuffer(String),

    /// Invalid count specified
    #[error("Invalid count: {0}")]
    InvalidCount(i64),

    /// The message-passing substrate returned an error code
    #[error("Transport error (code {0})")]
    Transport(i32),

    /// This rank was torn down by a group abort
    #[error("Group aborted with code {0}")]
    Aborted(i32),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an error from a substrate return code.
    pub fn from_code(code: i32) -> Self {
        debug_assert_ne!(code, 0, "from_code called with success code");
        Error::Transport(code)
    }

    /// Check a substrate return code, returning Ok(()) for success.
    pub fn check(code: i32) -> Result<()> {
        if code == 0 {
            Ok(())
        } else {
            Err(Error::from_code(code))
        }
    }

    /// Wrap an I/O error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a configuration error for `path`.
    pub fn config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Config {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error must tear down every participant.
    ///
    /// `Aborted` is the one exception: it is what a rank observes once the
    /// teardown is already under way, so aborting again is pointless.
    pub fn is_group_fatal(&self) -> bool {
        !matches!(self, Error::Aborted(_))
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::GroupTooSmall(_)
            | Error::Config { .. }
            | Error::WidthMismatch { .. }
            | Error::InvalidOption(_) => 2,
            Error::Envelope { .. } | Error::Allocation(_) => 3,
            Error::CountMismatch { .. }
            | Error::SampleMismatch { .. }
            | Error::NoSamples
            | Error::Verification { .. } => 4,
            Error::Io { .. } => 5,
            Error::Aborted(code) if *code != 0 => *code,
            _ => 1,
        }
    }
}

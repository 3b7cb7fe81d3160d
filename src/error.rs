//! Error types.

use thiserror::Error;

/// Failure kinds of the renderer. Configuration and I/O problems surface
/// before any rendering begins; the remaining kinds abort the job, because a
/// frame that lost its closest-hit information cannot be recovered.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad command line or scene descriptor.
    #[error("configuration error: {0}")]
    Config(String),

    /// Missing or unreadable input file.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Any non-success reported by the MPI layer.
    #[error("mpi error: {0}")]
    Mpi(String),

    /// The infinite cache would exceed its configured budget.
    #[error("cache full: {0}")]
    CacheFull(String),

    /// An invariant of the depth loop was violated.
    #[error("invariant violated: {0}")]
    Assertion(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Abort the job on an unrecoverable failure inside the depth loop. A frame
/// that lost closest-hit information cannot be patched up, so there is no
/// unwind path.
pub fn fatal(err: &Error) -> ! {
    log::error!("fatal: {err}");
    std::process::abort();
}

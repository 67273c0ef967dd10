//! Types for the FUSE front-end.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use fuse3::raw::MountHandle as RawMountHandle;
use thiserror::Error;

/// Result type for FUSE-layer operations.
pub type FuseResult<T> = Result<T, FuseError>;

/// Errors that can occur in the FUSE front-end.
#[derive(Debug, Error)]
pub enum FuseError {
    /// I/O error during filesystem operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Mount operation failed
    #[error("mount failed: {0}")]
    MountFailed(String),
}

/// Handle to a mounted filesystem.
///
/// The handle can be awaited - it resolves when the filesystem is
/// unmounted (via [`unmount`](Self::unmount), Ctrl+C in the CLI, or an
/// external `fusermount -u`).
pub struct MountHandle {
    inner: RawMountHandle,
}

impl MountHandle {
    pub(crate) fn new(inner: RawMountHandle) -> Self {
        Self { inner }
    }

    /// Unmount the filesystem explicitly.
    pub async fn unmount(self) -> io::Result<()> {
        self.inner.unmount().await
    }
}

impl Future for MountHandle {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

//! FUSE front-end.
//!
//! Translates kernel upcalls into calls on the directory view, the
//! artifact cache and the materializer. All operations are async and run
//! on the Tokio runtime; the mount is declared read-only at the kernel
//! level and every write-side upcall answers `EROFS`.

mod filesystem;
mod inode;
mod types;

pub use filesystem::CueFs;
pub use inode::{InodeManager, ROOT_INODE};
pub use types::{FuseError, FuseResult, MountHandle};

use std::path::Path;

use fuse3::raw::Session;
use fuse3::MountOptions;
use tracing::info;

/// Mount the filesystem at `mountpoint`.
///
/// Uses the unprivileged mount path (fusermount) so no capabilities are
/// required beyond access to `/dev/fuse`. The returned handle resolves
/// when the filesystem is unmounted.
pub async fn mount(fs: CueFs, mountpoint: &Path) -> FuseResult<MountHandle> {
    let mut options = MountOptions::default();
    options.read_only(true).fs_name("cuefs");

    info!(mountpoint = %mountpoint.display(), "mounting");
    let handle = Session::new(options)
        .mount_with_unprivileged(fs, mountpoint)
        .await
        .map_err(|e| FuseError::MountFailed(e.to_string()))?;
    Ok(MountHandle::new(handle))
}

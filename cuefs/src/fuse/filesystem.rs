//! The fuse3 filesystem implementation.
//!
//! Every upcall runs as its own Tokio task, so a track materialization
//! blocking one `open` never stalls unrelated reads. The filesystem is
//! strictly read-only: the mount itself is declared read-only and every
//! mutating upcall answers `EROFS`.

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::vec::IntoIter;

use bytes::Bytes;
use futures_util::stream::{self, Iter};
use fuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use fuse3::raw::{Filesystem, Request};
use fuse3::{Errno, FileType, Result, SetAttr, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::app::{Config, ConfigError};
use crate::cache::{Artifact, ArtifactCache, CacheError};
use crate::materialize::Materializer;
use crate::probe::{AlbumInfo, ProbeCache, TrackSpan};
use crate::view::{DirectoryView, EntryKind, Resolved, ViewError};

use super::inode::{InodeManager, ROOT_INODE};

/// Attribute cache TTL handed to the kernel.
const TTL: Duration = Duration::from_secs(1);

/// One open file handle.
#[derive(Clone)]
enum FileHandle {
    /// A real file on the source filesystem.
    Passthrough(Arc<std::fs::File>),
    /// A pinned artifact of a synthetic track.
    Track {
        artifact: Arc<Artifact>,
        key: String,
    },
}

/// The cuefs filesystem.
pub struct CueFs {
    view: Arc<DirectoryView>,
    cache: ArtifactCache,
    materializer: Arc<Materializer>,
    inodes: InodeManager,
    handles: Mutex<HashMap<u64, FileHandle>>,
    next_fh: AtomicU64,
}

impl CueFs {
    /// Wire up all components from a validated configuration.
    pub fn new(config: Config) -> std::result::Result<Self, ConfigError> {
        if !config.source_root.is_dir() {
            return Err(ConfigError::SourceRoot(config.source_root.clone()));
        }
        let codec = config.codec()?;
        let ignore = config.ignore_regex()?;
        let view = DirectoryView::new(
            config.source_root.clone(),
            codec,
            ProbeCache::new(config.probe_capacity),
            config.keep_album,
        );
        Ok(Self {
            view: Arc::new(view),
            cache: ArtifactCache::new(config.cache_config()),
            materializer: Arc::new(Materializer::new(config.tool_spec(), ignore)),
            inodes: InodeManager::new(),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        })
    }

    /// The artifact cache, exposed for stats reporting.
    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Cache key of a synthetic track: its root-relative virtual path.
    fn track_key(rel: &Path) -> String {
        rel.to_string_lossy().into_owned()
    }

    fn rel_of(&self, inode: u64) -> Result<std::path::PathBuf> {
        self.inodes.path_of(inode).ok_or_else(|| libc::ENOENT.into())
    }

    /// Attributes of a virtual path.
    async fn attr_for(&self, rel: &Path, ino: u64) -> Result<FileAttr> {
        match self.view.resolve(rel).await.map_err(errno_of_view)? {
            Resolved::Passthrough(physical) => {
                let meta = tokio::fs::symlink_metadata(&physical)
                    .await
                    .map_err(errno_of_io)?;
                Ok(passthrough_attr(ino, &meta))
            }
            Resolved::Track { album, span } => {
                let meta = tokio::fs::symlink_metadata(&album.path)
                    .await
                    .map_err(errno_of_io)?;
                let size = self
                    .cache
                    .ready_size(&Self::track_key(rel))
                    .unwrap_or_else(|| album.raw_pcm_len(&span));
                Ok(track_attr(ino, &meta, size))
            }
        }
    }

    /// Collect the virtual entries of a directory, with `.` and `..`
    /// in front, each paired with its inode and kind.
    async fn directory_entries(
        &self,
        parent: u64,
        parent_rel: &Path,
    ) -> Result<Vec<(u64, FileType, OsString)>> {
        let parent_parent = parent_rel
            .parent()
            .map(|p| self.inodes.assign(p))
            .unwrap_or(ROOT_INODE);

        let mut out: Vec<(u64, FileType, OsString)> = vec![
            (parent, FileType::Directory, OsString::from(".")),
            (parent_parent, FileType::Directory, OsString::from("..")),
        ];
        let listed = self
            .view
            .read_dir(parent_rel)
            .await
            .map_err(errno_of_io)?;
        for entry in listed {
            let rel = parent_rel.join(&entry.name);
            let ino = self.inodes.assign(&rel);
            out.push((ino, file_type_of(entry.kind), entry.name));
        }
        Ok(out)
    }
}

fn file_type_of(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::Directory => FileType::Directory,
        EntryKind::File => FileType::RegularFile,
        EntryKind::Symlink => FileType::Symlink,
    }
}

fn errno_of_view(e: ViewError) -> Errno {
    match e {
        ViewError::NotFound => libc::ENOENT.into(),
        ViewError::Io(io) => errno_of_io(io),
    }
}

fn errno_of_io(e: std::io::Error) -> Errno {
    e.raw_os_error().unwrap_or(libc::EIO).into()
}

fn errno_of_cache(e: CacheError) -> Errno {
    debug!(error = %e, "artifact acquisition failed");
    Errno::from(libc::EIO)
}

fn timestamp(secs: i64, nanos: i64) -> Timestamp {
    Timestamp::new(secs, nanos as u32)
}

/// Attributes of a physical file, passed through.
fn passthrough_attr(ino: u64, meta: &std::fs::Metadata) -> FileAttr {
    let kind = if meta.is_dir() {
        FileType::Directory
    } else if meta.file_type().is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    };
    FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        kind,
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
    }
}

/// Attributes of a synthetic track: read-only regular file, owner and
/// times inherited from the album.
fn track_attr(ino: u64, album_meta: &std::fs::Metadata, size: u64) -> FileAttr {
    FileAttr {
        ino,
        size,
        blocks: size.div_ceil(512),
        atime: timestamp(album_meta.atime(), album_meta.atime_nsec()),
        mtime: timestamp(album_meta.mtime(), album_meta.mtime_nsec()),
        ctime: timestamp(album_meta.ctime(), album_meta.ctime_nsec()),
        kind: FileType::RegularFile,
        perm: 0o444,
        nlink: 1,
        uid: album_meta.uid(),
        gid: album_meta.gid(),
        rdev: 0,
        blksize: album_meta.blksize() as u32,
    }
}

impl Filesystem for CueFs {
    type DirEntryStream<'a>
        = Iter<IntoIter<Result<DirectoryEntry>>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = Iter<IntoIter<Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> Result<ReplyInit> {
        Ok(ReplyInit {
            max_write: NonZeroU32::new(128 * 1024).expect("constant is non-zero"),
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> Result<ReplyEntry> {
        let parent_rel = self.rel_of(parent)?;
        let rel = parent_rel.join(name);
        let ino = self.inodes.assign(&rel);
        let attr = self.attr_for(&rel, ino).await?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr,
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        inode: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> Result<ReplyAttr> {
        let rel = self.rel_of(inode)?;
        let attr = self.attr_for(&rel, inode).await?;
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn readdir(
        &self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: i64,
    ) -> Result<ReplyDirectory<Self::DirEntryStream<'_>>> {
        let parent_rel = self.rel_of(parent)?;
        let entries = self.directory_entries(parent, &parent_rel).await?;

        let listed: Vec<Result<DirectoryEntry>> = entries
            .into_iter()
            .enumerate()
            .map(|(i, (inode, kind, name))| {
                Ok(DirectoryEntry {
                    inode,
                    kind,
                    name,
                    offset: i as i64 + 1,
                })
            })
            .skip(offset as usize)
            .collect();

        Ok(ReplyDirectory {
            entries: stream::iter(listed),
        })
    }

    async fn readdirplus(
        &self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'_>>> {
        let parent_rel = self.rel_of(parent)?;
        let entries = self.directory_entries(parent, &parent_rel).await?;

        let mut listed = Vec::with_capacity(entries.len());
        for (i, (inode, kind, name)) in entries.into_iter().enumerate() {
            if (i as u64) < offset {
                continue;
            }
            let rel = match name.to_str() {
                Some(".") => parent_rel.clone(),
                Some("..") => parent_rel.parent().unwrap_or(Path::new("")).to_path_buf(),
                _ => parent_rel.join(&name),
            };
            let attr = match self.attr_for(&rel, inode).await {
                Ok(attr) => attr,
                // listings should not collapse because one entry vanished
                Err(e) => {
                    debug!(name = ?name, error = ?e, "skipping unresolvable entry");
                    continue;
                }
            };
            listed.push(Ok(DirectoryEntryPlus {
                inode,
                generation: 0,
                kind,
                name,
                offset: i as i64 + 1,
                attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            }));
        }

        Ok(ReplyDirectoryPlus {
            entries: stream::iter(listed),
        })
    }

    async fn open(&self, _req: Request, inode: u64, flags: u32) -> Result<ReplyOpen> {
        if flags as i32 & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(libc::EROFS.into());
        }
        let rel = self.rel_of(inode)?;

        let handle = match self.view.resolve(&rel).await.map_err(errno_of_view)? {
            Resolved::Passthrough(physical) => {
                let file = tokio::task::spawn_blocking(move || std::fs::File::open(physical))
                    .await
                    .map_err(|_| Errno::from(libc::EIO))?
                    .map_err(errno_of_io)?;
                FileHandle::Passthrough(Arc::new(file))
            }
            Resolved::Track { album, span } => {
                let key = Self::track_key(&rel);
                let artifact = self
                    .acquire_track(&key, album, span)
                    .await
                    .map_err(errno_of_cache)?;
                FileHandle::Track { artifact, key }
            }
        };

        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fh, handle);
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData> {
        let handle = self
            .handles
            .lock()
            .get(&fh)
            .cloned()
            .ok_or_else(|| Errno::from(libc::EBADF))?;

        match handle {
            FileHandle::Track { artifact, .. } => {
                let bytes = artifact.bytes();
                let start = (offset as usize).min(bytes.len());
                let end = (start + size as usize).min(bytes.len());
                Ok(ReplyData {
                    data: Bytes::copy_from_slice(&bytes[start..end]),
                })
            }
            FileHandle::Passthrough(file) => {
                let data = tokio::task::spawn_blocking(move || {
                    let mut buf = vec![0u8; size as usize];
                    let mut filled = 0usize;
                    while filled < buf.len() {
                        match file.read_at(&mut buf[filled..], offset + filled as u64) {
                            Ok(0) => break,
                            Ok(n) => filled += n,
                            Err(e) => return Err(e),
                        }
                    }
                    buf.truncate(filled);
                    Ok(buf)
                })
                .await
                .map_err(|_| Errno::from(libc::EIO))?
                .map_err(errno_of_io)?;
                Ok(ReplyData { data: data.into() })
            }
        }
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> Result<()> {
        let handle = self.handles.lock().remove(&fh);
        match handle {
            Some(FileHandle::Track { key, .. }) => self.cache.release(&key),
            Some(FileHandle::Passthrough(_)) => {}
            None => warn!(fh, "release of unknown file handle"),
        }
        Ok(())
    }

    async fn statfs(&self, _req: Request, _inode: u64) -> Result<ReplyStatFs> {
        // synthetic sizes: the projection has no meaningful block counts
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: 0,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    // ------------------------------------------------------------------------
    // Write side: everything answers EROFS.
    // ------------------------------------------------------------------------

    async fn mknod(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _rdev: u32,
    ) -> Result<ReplyEntry> {
        Err(libc::EROFS.into())
    }

    async fn mkdir(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> Result<ReplyEntry> {
        Err(libc::EROFS.into())
    }

    async fn unlink(&self, _req: Request, _parent: u64, _name: &OsStr) -> Result<()> {
        Err(libc::EROFS.into())
    }

    async fn rmdir(&self, _req: Request, _parent: u64, _name: &OsStr) -> Result<()> {
        Err(libc::EROFS.into())
    }

    async fn rename(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _new_parent: u64,
        _new_name: &OsStr,
    ) -> Result<()> {
        Err(libc::EROFS.into())
    }

    async fn symlink(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _link: &OsStr,
    ) -> Result<ReplyEntry> {
        Err(libc::EROFS.into())
    }

    async fn setattr(
        &self,
        _req: Request,
        _inode: u64,
        _fh: Option<u64>,
        _set_attr: SetAttr,
    ) -> Result<ReplyAttr> {
        Err(libc::EROFS.into())
    }

    async fn write(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _offset: u64,
        _data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> Result<ReplyWrite> {
        Err(libc::EROFS.into())
    }

    async fn create(
        &self,
        _req: Request,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _flags: u32,
    ) -> Result<ReplyCreated> {
        Err(libc::EROFS.into())
    }

    async fn setxattr(
        &self,
        _req: Request,
        _inode: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: u32,
        _position: u32,
    ) -> Result<()> {
        Err(libc::EROFS.into())
    }

    async fn removexattr(&self, _req: Request, _inode: u64, _name: &OsStr) -> Result<()> {
        Err(libc::EROFS.into())
    }

    async fn fallocate(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _offset: u64,
        _length: u64,
        _mode: u32,
    ) -> Result<()> {
        Err(libc::EROFS.into())
    }
}

impl CueFs {
    /// Acquire the artifact for a synthetic track, materializing on miss.
    async fn acquire_track(
        &self,
        key: &str,
        album: Arc<AlbumInfo>,
        span: TrackSpan,
    ) -> std::result::Result<Arc<Artifact>, CacheError> {
        let materializer = Arc::clone(&self.materializer);
        self.cache
            .acquire(key, move || async move {
                materializer.materialize(&album, &span).await
            })
            .await
    }
}

//! Loopback engine: every kernel request is answered from the backing root.
//!
//! `LoopbackFs` is independent of the fuser session so it can be driven
//! directly; [`crate::fs::fuse`] forwards the kernel callbacks to it. Each
//! operation returns `Result<_, Errno>`, the errno going back to the kernel
//! unchanged.

use std::{
    ffi::{OsStr, OsString},
    fs::{self, DirBuilder, Metadata, OpenOptions, Permissions},
    io,
    os::unix::fs::{DirBuilderExt, FileTypeExt, MetadataExt, PermissionsExt},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use fuser::{FileAttr, FileType, TimeOrNow};
use tracing::{debug, warn};

use crate::{
    fs::{
        cache::CacheMaterializer,
        handle::{open_raw, path_cstring, HandleTable, OpenFileHandle},
        ident::stable_attr,
        inode::{NodeTable, ROOT_INO},
        variant::Interceptor,
        Errno, DEFAULT_TTL,
    },
    logging::MountSummary,
};

/// Counters shared between the engine and whoever owns the mount.
#[derive(Debug, Default)]
pub struct MountStats {
    lookups: AtomicU64,
    opens: AtomicU64,
    creates: AtomicU64,
    closes: AtomicU64,
    uncorrelated_closes: AtomicU64,
    handles_open: AtomicUsize,
}

impl MountStats {
    /// Counters plus the cache state, when there is a cache.
    pub fn summary(&self, cache: Option<&CacheMaterializer>) -> MountSummary {
        let mut summary = MountSummary {
            lookups: self.lookups.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
            uncorrelated_closes: self.uncorrelated_closes.load(Ordering::Relaxed),
            handles_open: self.handles_open.load(Ordering::Relaxed),
            ..MountSummary::default()
        };
        if let Some(cache) = cache {
            let stats = cache.stats();
            summary.cache_copies = stats.copies;
            summary.cache_hits = stats.hits;
            summary.cache_files = cache.list_cached_paths().len();
        }
        summary
    }
}

/// Reply to a successful lookup, mkdir or create.
#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub attr: FileAttr,
    pub generation: u64,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: u64,
    /// Offset of the entry that follows this one.
    pub offset: i64,
    pub kind: FileType,
    pub name: OsString,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
}

impl SetAttr {
    fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.size.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

pub struct LoopbackFs<I: Interceptor> {
    nodes: NodeTable,
    handles: HandleTable,
    interceptor: I,
    root_dev: u64,
    read_only: bool,
    ttl: Duration,
    stats: Arc<MountStats>,
}

impl<I: Interceptor> std::fmt::Debug for LoopbackFs<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackFs")
            .field("backing_root", &self.nodes.backing_root())
            .field("variant", &self.interceptor.variant())
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl<I: Interceptor> LoopbackFs<I> {
    /// Serve `backing_root`; its device becomes the reference device for
    /// synthetic inode numbers.
    pub fn new(backing_root: impl Into<PathBuf>, interceptor: I) -> io::Result<Self> {
        let backing_root = backing_root.into();
        let root_dev = fs::metadata(&backing_root)?.dev();
        Ok(Self {
            nodes: NodeTable::new(backing_root),
            handles: HandleTable::new(),
            interceptor,
            root_dev,
            read_only: false,
            ttl: DEFAULT_TTL,
            stats: Arc::new(MountStats::default()),
        })
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_stats(mut self, stats: Arc<MountStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn backing_root(&self) -> &Path {
        self.nodes.backing_root()
    }

    pub fn root_dev(&self) -> u64 {
        self.root_dev
    }

    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn interceptor(&self) -> &I {
        &self.interceptor
    }

    pub fn stats(&self) -> &Arc<MountStats> {
        &self.stats
    }

    pub fn summary(&self) -> MountSummary {
        self.stats.summary(self.interceptor.cache().map(|c| c.as_ref()))
    }

    fn resolve(&self, ino: u64) -> Result<PathBuf, Errno> {
        self.nodes.resolve(ino).ok_or(Errno::ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<PathBuf, Errno> {
        self.nodes.child_path(parent, name).ok_or(Errno::ENOENT)
    }

    fn ensure_writable(&self) -> Result<(), Errno> {
        if self.read_only {
            Err(Errno::EROFS)
        } else {
            Ok(())
        }
    }

    fn entry_for(&self, parent: u64, name: &OsStr, meta: &Metadata) -> Entry {
        let id = stable_attr(meta.mode(), meta.dev(), meta.ino(), self.root_dev);
        self.nodes.remember(parent, name, id.ino);
        Entry {
            attr: file_attr(id.ino, meta),
            generation: id.generation,
        }
    }

    /// Any failure to stat the child is reported as "no such entry".
    pub fn lookup(&self, parent: u64, name: &OsStr) -> Result<Entry, Errno> {
        let path = self.child(parent, name)?;
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "lookup miss");
                return Err(Errno::ENOENT);
            }
        };
        self.interceptor.on_lookup(&path);
        self.stats.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.entry_for(parent, name, &meta))
    }

    pub fn forget(&self, ino: u64, nlookup: u64) {
        self.nodes.forget(ino, nlookup);
    }

    pub fn getattr(&self, ino: u64) -> Result<FileAttr, Errno> {
        let path = self.resolve(ino)?;
        let meta = fs::symlink_metadata(&path)?;
        Ok(file_attr(ino, &meta))
    }

    pub fn setattr(&self, ino: u64, changes: SetAttr, fh: Option<u64>) -> Result<FileAttr, Errno> {
        if changes.is_empty() {
            return self.getattr(ino);
        }
        self.ensure_writable()?;
        let path = self.resolve(ino)?;

        if let Some(mode) = changes.mode {
            fs::set_permissions(&path, Permissions::from_mode(mode & 0o7777))?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            std::os::unix::fs::lchown(&path, changes.uid, changes.gid)?;
        }
        let handle = fh.and_then(|fh| self.handles.get(fh));
        if let Some(size) = changes.size {
            match &handle {
                Some(handle) => handle.file().set_len(size)?,
                None => OpenOptions::new().write(true).open(&path)?.set_len(size)?,
            }
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            let times = [timespec(changes.atime), timespec(changes.mtime)];
            let rc = match &handle {
                Some(handle) => unsafe { libc::futimens(handle.fid(), times.as_ptr()) },
                None => {
                    let c_path = path_cstring(&path)?;
                    unsafe {
                        libc::utimensat(
                            libc::AT_FDCWD,
                            c_path.as_ptr(),
                            times.as_ptr(),
                            libc::AT_SYMLINK_NOFOLLOW,
                        )
                    }
                }
            };
            if rc != 0 {
                return Err(Errno::last_os_error());
            }
        }
        self.getattr(ino)
    }

    pub fn readlink(&self, ino: u64) -> Result<Vec<u8>, Errno> {
        let path = self.resolve(ino)?;
        Ok(read_link_bytes(&path)?)
    }

    /// Open `ino` and return the kernel file handle.
    ///
    /// `O_APPEND` is dropped: the kernel always passes explicit offsets.
    pub fn open(&self, ino: u64, flags: i32) -> Result<u64, Errno> {
        let path = self.resolve(ino)?;
        let flags = flags & !(libc::O_APPEND | libc::O_CREAT | libc::O_EXCL);
        if self.read_only && wants_write(flags) {
            return Err(Errno::EROFS);
        }

        let target = self.interceptor.open_target(&path).map_err(|err| {
            warn!(path = %path.display(), error = %err, "open target unavailable");
            Errno::from(err)
        })?;
        let fid = open_raw(&target, flags, 0)?;
        self.interceptor.on_open(&path, fid);
        self.stats.opens.fetch_add(1, Ordering::Relaxed);

        let fh = self.insert_handle(OpenFileHandle::from_raw(fid, path));
        debug!(ino, fh, fid, target = %target.display(), "open");
        Ok(fh)
    }

    pub fn create(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> Result<(Entry, u64), Errno> {
        self.ensure_writable()?;
        let path = self.child(parent, name)?;
        let flags = (flags & !libc::O_APPEND) | libc::O_CREAT;
        let fid = open_raw(&path, flags, mode & !umask)?;
        let handle = OpenFileHandle::from_raw(fid, &path);
        let meta = handle.file().metadata()?;

        let entry = self.entry_for(parent, name, &meta);
        self.interceptor.on_create(&path, fid);
        self.stats.creates.fetch_add(1, Ordering::Relaxed);

        let fh = self.insert_handle(handle);
        debug!(parent, fh, fid, path = %path.display(), "create");
        Ok((entry, fh))
    }

    fn insert_handle(&self, handle: OpenFileHandle) -> u64 {
        self.stats.handles_open.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(handle)
    }

    pub fn read(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, Errno> {
        let handle = self.handles.get(fh).ok_or(Errno::EBADF)?;
        Ok(handle.read_at(offset.max(0) as u64, size as usize)?)
    }

    pub fn write(&self, fh: u64, offset: i64, data: &[u8]) -> Result<u32, Errno> {
        self.ensure_writable()?;
        let handle = self.handles.get(fh).ok_or(Errno::EBADF)?;
        let written = handle.write_at(data, offset.max(0) as u64)?;
        Ok(written as u32)
    }

    /// Records `Close` for the handle the first time it is flushed. A flush
    /// for an unknown handle is still recorded, without a descriptor.
    pub fn flush(&self, ino: u64, fh: u64) -> Result<(), Errno> {
        match self.handles.get(fh) {
            Some(handle) => {
                if handle.mark_close_recorded() {
                    self.record_close(handle.path(), Some(handle.fid()));
                }
            }
            None => {
                let path = self
                    .nodes
                    .resolve(ino)
                    .unwrap_or_else(|| PathBuf::from(format!("<ino {ino}>")));
                warn!(ino, fh, path = %path.display(), "flush for unknown handle");
                self.stats.uncorrelated_closes.fetch_add(1, Ordering::Relaxed);
                self.record_close(&path, None);
            }
        }
        Ok(())
    }

    /// Drops the handle; the descriptor closes with the last reference.
    pub fn release(&self, fh: u64) -> Result<(), Errno> {
        if let Some(handle) = self.handles.remove(fh) {
            if handle.mark_close_recorded() {
                self.record_close(handle.path(), Some(handle.fid()));
            }
            self.stats.handles_open.fetch_sub(1, Ordering::Relaxed);
            debug!(fh, fid = handle.fid(), "release");
        }
        Ok(())
    }

    fn record_close(&self, path: &Path, fid: Option<i32>) {
        self.interceptor.on_close(path, fid);
        self.stats.closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> Result<(), Errno> {
        let handle = self.handles.get(fh).ok_or(Errno::EBADF)?;
        Ok(handle.sync(datasync)?)
    }

    pub fn mkdir(&self, parent: u64, name: &OsStr, mode: u32, umask: u32) -> Result<Entry, Errno> {
        self.ensure_writable()?;
        let path = self.child(parent, name)?;
        DirBuilder::new().mode(mode & !umask).create(&path)?;
        let meta = fs::symlink_metadata(&path)?;
        Ok(self.entry_for(parent, name, &meta))
    }

    pub fn unlink(&self, parent: u64, name: &OsStr) -> Result<(), Errno> {
        self.ensure_writable()?;
        let path = self.child(parent, name)?;
        Ok(fs::remove_file(&path)?)
    }

    pub fn rmdir(&self, parent: u64, name: &OsStr) -> Result<(), Errno> {
        self.ensure_writable()?;
        let path = self.child(parent, name)?;
        Ok(fs::remove_dir(&path)?)
    }

    /// Device nodes, fifos and sockets. Creating device nodes needs the
    /// privileges the backing filesystem asks for.
    pub fn mknod(
        &self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
    ) -> Result<Entry, Errno> {
        self.ensure_writable()?;
        let path = self.child(parent, name)?;
        let c_path = path_cstring(&path)?;
        let mode = (mode & !umask) as libc::mode_t;
        if unsafe { libc::mknod(c_path.as_ptr(), mode, libc::dev_t::from(rdev)) } != 0 {
            return Err(Errno::last_os_error());
        }
        let meta = fs::symlink_metadata(&path)?;
        Ok(self.entry_for(parent, name, &meta))
    }

    pub fn symlink(&self, parent: u64, name: &OsStr, target: &Path) -> Result<Entry, Errno> {
        self.ensure_writable()?;
        let path = self.child(parent, name)?;
        std::os::unix::fs::symlink(target, &path)?;
        let meta = fs::symlink_metadata(&path)?;
        Ok(self.entry_for(parent, name, &meta))
    }

    /// Hard link `ino` as `new_name` in `new_parent`. The node follows the
    /// newest name.
    pub fn link(&self, ino: u64, new_parent: u64, new_name: &OsStr) -> Result<Entry, Errno> {
        self.ensure_writable()?;
        let source = self.resolve(ino)?;
        let path = self.child(new_parent, new_name)?;
        fs::hard_link(&source, &path)?;
        let meta = fs::symlink_metadata(&path)?;
        Ok(self.entry_for(new_parent, new_name, &meta))
    }

    /// `flags` are the `renameat2` flags (`RENAME_NOREPLACE`,
    /// `RENAME_EXCHANGE`).
    pub fn rename(
        &self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        flags: u32,
    ) -> Result<(), Errno> {
        self.ensure_writable()?;
        let from = self.child(parent, name)?;
        let to = self.child(new_parent, new_name)?;
        if flags == 0 {
            fs::rename(&from, &to)?;
        } else {
            let c_from = path_cstring(&from)?;
            let c_to = path_cstring(&to)?;
            let rc = unsafe {
                libc::renameat2(
                    libc::AT_FDCWD,
                    c_from.as_ptr(),
                    libc::AT_FDCWD,
                    c_to.as_ptr(),
                    flags as libc::c_uint,
                )
            };
            if rc != 0 {
                return Err(Errno::last_os_error());
            }
        }
        self.nodes.rename(
            parent,
            name,
            new_parent,
            new_name,
            flags & libc::RENAME_EXCHANGE != 0,
        );
        debug!(from = %from.display(), to = %to.display(), "rename");
        Ok(())
    }

    /// Entries of directory `ino` from `offset` on, sorted by name after `.`
    /// and `..` so offsets stay stable between calls.
    pub fn readdir(&self, ino: u64, offset: i64) -> Result<Vec<DirEntry>, Errno> {
        let path = self.resolve(ino)?;
        let parent = self.nodes.get(ino).map(|n| n.parent()).unwrap_or(ROOT_INO);

        let mut children = Vec::new();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            // Entries removed between readdir and stat are skipped.
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let id = stable_attr(meta.mode(), meta.dev(), meta.ino(), self.root_dev);
            children.push((id.ino, file_kind(meta.file_type()), entry.file_name()));
        }
        children.sort_by(|a, b| a.2.cmp(&b.2));

        let entries = [
            (ino, FileType::Directory, OsString::from(".")),
            (parent, FileType::Directory, OsString::from("..")),
        ]
        .into_iter()
        .chain(children)
        .enumerate()
        .skip(offset.max(0) as usize)
        .map(|(i, (ino, kind, name))| DirEntry {
            ino,
            offset: i as i64 + 1,
            kind,
            name,
        })
        .collect();
        Ok(entries)
    }

    pub fn statfs(&self, ino: u64) -> Result<StatFs, Errno> {
        let path = self.resolve(ino)?;
        let c_path = path_cstring(&path)?;
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::statvfs(c_path.as_ptr(), &mut st) } != 0 {
            return Err(Errno::last_os_error());
        }
        Ok(StatFs {
            blocks: st.f_blocks as u64,
            bfree: st.f_bfree as u64,
            bavail: st.f_bavail as u64,
            files: st.f_files as u64,
            ffree: st.f_ffree as u64,
            bsize: st.f_bsize as u32,
            namelen: st.f_namemax as u32,
            frsize: st.f_frsize as u32,
        })
    }

    pub fn access(&self, ino: u64, mask: i32) -> Result<(), Errno> {
        if self.read_only && mask & libc::W_OK != 0 {
            return Err(Errno::EROFS);
        }
        let path = self.resolve(ino)?;
        let c_path = path_cstring(&path)?;
        if unsafe { libc::access(c_path.as_ptr(), mask) } != 0 {
            return Err(Errno::last_os_error());
        }
        Ok(())
    }
}

/// `utimensat` argument for one timestamp; an unset time is left alone.
fn timespec(time: Option<TimeOrNow>) -> libc::timespec {
    let (tv_sec, tv_nsec) = match time {
        None => (0, libc::UTIME_OMIT),
        Some(TimeOrNow::Now) => (0, libc::UTIME_NOW),
        Some(TimeOrNow::SpecificTime(at)) => match at.duration_since(UNIX_EPOCH) {
            Ok(d) => (d.as_secs() as libc::time_t, d.subsec_nanos() as libc::c_long),
            Err(before) => {
                let d = before.duration();
                if d.subsec_nanos() == 0 {
                    (-(d.as_secs() as libc::time_t), 0)
                } else {
                    (
                        -(d.as_secs() as libc::time_t) - 1,
                        (1_000_000_000 - d.subsec_nanos()) as libc::c_long,
                    )
                }
            }
        },
    };
    libc::timespec { tv_sec, tv_nsec }
}

fn wants_write(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0
}

/// Read a symlink target as raw bytes, growing the buffer until it fits.
pub fn read_link_bytes(path: &Path) -> io::Result<Vec<u8>> {
    let c_path = path_cstring(path)?;
    let mut capacity = 256usize;
    loop {
        let mut buf = vec![0u8; capacity];
        let n = unsafe {
            libc::readlink(
                c_path.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_char,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n < capacity {
            buf.truncate(n);
            return Ok(buf);
        }
        capacity *= 2;
    }
}

pub fn file_kind(file_type: fs::FileType) -> FileType {
    if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_symlink() {
        FileType::Symlink
    } else if file_type.is_block_device() {
        FileType::BlockDevice
    } else if file_type.is_char_device() {
        FileType::CharDevice
    } else if file_type.is_fifo() {
        FileType::NamedPipe
    } else if file_type.is_socket() {
        FileType::Socket
    } else {
        FileType::RegularFile
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    let nsecs = nsecs.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs)
    } else {
        UNIX_EPOCH
            .checked_sub(Duration::new(secs.unsigned_abs(), 0))
            .unwrap_or(UNIX_EPOCH)
    }
}

/// Attributes of the backing entry reported under the synthetic `ino`.
pub fn file_attr(ino: u64, meta: &Metadata) -> FileAttr {
    let ctime = system_time(meta.ctime(), meta.ctime_nsec());
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.blocks(),
        atime: system_time(meta.atime(), meta.atime_nsec()),
        mtime: system_time(meta.mtime(), meta.mtime_nsec()),
        ctime,
        crtime: meta.created().unwrap_or(ctime),
        kind: file_kind(meta.file_type()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}

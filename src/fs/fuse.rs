//! fuser adapter that forwards kernel callbacks to a [`LoopbackFs`].

use std::{
    ffi::{OsStr, OsString},
    path::Path,
    sync::Arc,
    time::SystemTime,
};

use fuser::{
    BackgroundSession, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use tracing::debug;

use crate::{
    fs::{
        loopback::{LoopbackFs, SetAttr},
        variant::Interceptor,
        FS_SUBTYPE,
    },
    Result,
};

pub struct FuseAdapter<I: Interceptor> {
    fs: Arc<LoopbackFs<I>>,
}

impl<I: Interceptor> FuseAdapter<I> {
    pub fn new(fs: Arc<LoopbackFs<I>>) -> Self {
        Self { fs }
    }
}

impl<I: Interceptor> Filesystem for FuseAdapter<I> {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.fs.lookup(parent, name) {
            Ok(entry) => reply.entry(&self.fs.ttl(), &entry.attr, entry.generation),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.fs.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.fs.getattr(ino) {
            Ok(attr) => reply.attr(&self.fs.ttl(), &attr),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = SetAttr {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
        };
        match self.fs.setattr(ino, changes, fh) {
            Ok(attr) => reply.attr(&self.fs.ttl(), &attr),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.fs.readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        match self.fs.mkdir(parent, name, mode, umask) {
            Ok(entry) => reply.entry(&self.fs.ttl(), &entry.attr, entry.generation),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.fs.unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.fs.rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        match self.fs.mknod(parent, name, mode, umask, rdev) {
            Ok(entry) => reply.entry(&self.fs.ttl(), &entry.attr, entry.generation),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        match self.fs.symlink(parent, link_name, target) {
            Ok(entry) => reply.entry(&self.fs.ttl(), &entry.attr, entry.generation),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        match self.fs.rename(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        match self.fs.link(ino, newparent, newname) {
            Ok(entry) => reply.entry(&self.fs.ttl(), &entry.attr, entry.generation),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.fs.open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.fs.read(fh, offset, size) {
            Ok(bytes) => reply.data(&bytes),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.fs.write(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.fs.flush(ino, fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.fs.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.fs.readdir(ino, offset) {
            Ok(entries) => {
                for entry in entries {
                    if reply.add(entry.ino, entry.offset, entry.kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        match self.fs.statfs(ino) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.fs.access(ino, mask) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.code()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        match self.fs.create(parent, name, mode, umask, flags) {
            Ok((entry, fh)) => reply.created(&self.fs.ttl(), &entry.attr, entry.generation, fh, 0),
            Err(errno) => reply.error(errno.code()),
        }
    }
}

/// Mount options for a loopback of `backing_root`.
pub fn mount_options(backing_root: &Path, read_only: bool, allow_other: bool) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::FSName(backing_root.to_string_lossy().into_owned()),
        MountOption::Subtype(FS_SUBTYPE.to_string()),
    ];
    if read_only {
        options.push(MountOption::RO);
    }
    if allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}

/// Start a background FUSE session serving `fs` at `mountpoint`.
pub fn spawn<I: Interceptor>(
    fs: Arc<LoopbackFs<I>>,
    mountpoint: &Path,
    allow_other: bool,
) -> Result<BackgroundSession> {
    let options = mount_options(fs.backing_root(), fs.is_read_only(), allow_other);
    match fuser::spawn_mount2(FuseAdapter::new(fs.clone()), mountpoint, &options) {
        Ok(session) => Ok(session),
        Err(e) => {
            // Older fusermount rejects the options-based mount; retry with
            // the legacy argument form before giving up.
            if let Some(code) = e.raw_os_error() {
                if code != libc::ENOSYS && code != libc::EPERM && code != libc::EACCES {
                    return Err(e.into());
                }
            }
            debug!(error = %e, "spawn_mount2 failed; retrying with legacy mount");

            let mut opts = format!(
                "fsname={},subtype={FS_SUBTYPE}",
                fs.backing_root().display()
            );
            if fs.is_read_only() {
                opts.push_str(",ro");
            }
            if allow_other {
                opts.push_str(",allow_other");
            }
            let opts = OsString::from(opts);
            let args: [&OsStr; 2] = [OsStr::new("-o"), opts.as_os_str()];
            #[allow(deprecated)]
            let session = fuser::spawn_mount(FuseAdapter::new(fs), mountpoint, &args)?;
            Ok(session)
        }
    }
}

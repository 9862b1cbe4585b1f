//! Open file handles that keep the real descriptor number alongside the file.

use std::{
    ffi::CString,
    fs::File,
    io,
    os::unix::{
        ffi::OsStrExt,
        fs::FileExt,
        io::{AsRawFd, FromRawFd, RawFd},
    },
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;

pub(crate) fn path_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

/// Open `path` with `open(2)` so the descriptor number is known to the caller.
pub fn open_raw(path: &Path, flags: i32, mode: u32) -> io::Result<RawFd> {
    let c_path = path_cstring(path)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Kernel file handle state: the open file, its descriptor number for event
/// correlation, and the backing path it was opened for.
#[derive(Debug)]
pub struct OpenFileHandle {
    file: File,
    fid: RawFd,
    path: PathBuf,
    close_recorded: AtomicBool,
}

impl OpenFileHandle {
    /// Take ownership of a descriptor returned by [`open_raw`].
    pub fn from_raw(fid: RawFd, path: impl Into<PathBuf>) -> Self {
        // The descriptor was just returned by open(2) and nothing else owns it.
        let file = unsafe { File::from_raw_fd(fid) };
        Self {
            file,
            fid,
            path: path.into(),
            close_recorded: AtomicBool::new(false),
        }
    }

    pub fn new(file: File, path: impl Into<PathBuf>) -> Self {
        let fid = file.as_raw_fd();
        Self {
            file,
            fid,
            path: path.into(),
            close_recorded: AtomicBool::new(false),
        }
    }

    pub fn fid(&self) -> RawFd {
        self.fid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn read_at(&self, offset: u64, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    pub fn sync(&self, datasync: bool) -> io::Result<()> {
        if datasync {
            self.file.sync_data()
        } else {
            self.file.sync_all()
        }
    }

    /// Returns true exactly once, for the call that should emit `Close`.
    pub fn mark_close_recorded(&self) -> bool {
        !self.close_recorded.swap(true, Ordering::SeqCst)
    }
}

/// Live handles keyed by the `fh` handed to the kernel.
#[derive(Debug)]
pub struct HandleTable {
    next_fh: AtomicU64,
    handles: DashMap<u64, Arc<OpenFileHandle>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: DashMap::new(),
        }
    }

    pub fn insert(&self, handle: OpenFileHandle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.handles.insert(fh, Arc::new(handle));
        fh
    }

    pub fn get(&self, fh: u64) -> Option<Arc<OpenFileHandle>> {
        self.handles.get(&fh).map(|h| h.clone())
    }

    pub fn remove(&self, fh: u64) -> Option<Arc<OpenFileHandle>> {
        self.handles.remove(&fh).map(|(_, h)| h)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

//! Filesystem core for compatfs.
//!
//! Holds the mount configuration and on-disk layout types, plus the loopback
//! engine, its per-variant interceptors and the fuser adapter that serves it.

use std::{
    fmt, io,
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::{info, warn};

use crate::{Error, Result};

pub mod cache;
pub mod events;
pub mod fuse;
pub mod handle;
pub mod ident;
pub mod inode;
pub mod loopback;
pub mod mount;
pub mod variant;

/// Sub-tree of a caching mount that serves the live passthrough view.
pub const ROOT_FS: &str = "root";
/// Sub-tree of a caching mount that holds materialized copies.
pub const CACHE_FS: &str = "cache";
/// Default backing root: the whole host filesystem.
pub const DEFAULT_BACKING_ROOT: &str = "/";
/// Second column of `df -T` shows `fuse.<subtype>`.
pub const FS_SUBTYPE: &str = "loopback";
/// Matches the libfuse default attribute and entry timeout.
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Raw errno returned to the kernel from a per-call operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const EROFS: Errno = Errno(libc::EROFS);
    pub const EINVAL: Errno = Errno(libc::EINVAL);

    pub fn last_os_error() -> Self {
        io::Error::last_os_error().into()
    }

    pub fn code(self) -> i32 {
        self.0
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<&io::Error> for Errno {
    fn from(err: &io::Error) -> Self {
        Errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

/// Which cross-cutting behaviour wraps the loopback calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountVariant {
    /// Plain loopback of the backing root.
    Passthrough,
    /// Loopback that appends every lookup/open/create/close to the event log.
    Recording,
    /// Loopback served under `root/` that copies opened files into `cache/`.
    Caching,
}

impl MountVariant {
    fn temp_prefix(self) -> &'static str {
        match self {
            MountVariant::Passthrough => "compatfs",
            MountVariant::Recording => "recordfs",
            MountVariant::Caching => "slimfs",
        }
    }
}

impl fmt::Display for MountVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MountVariant::Passthrough => "passthrough",
            MountVariant::Recording => "recording",
            MountVariant::Caching => "caching",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct MountConfig {
    pub variant: MountVariant,
    pub backing_root: PathBuf,
    /// Where to mount; a fresh temporary directory is created when unset.
    pub mount_path: Option<PathBuf>,
    pub read_only: bool,
    /// Event log destination; recording is disabled when unset.
    pub event_log: Option<PathBuf>,
    pub allow_other: bool,
    pub ttl: Duration,
}

impl MountConfig {
    pub fn new(variant: MountVariant, backing_root: impl Into<PathBuf>) -> Self {
        Self {
            variant,
            backing_root: backing_root.into(),
            mount_path: None,
            read_only: false,
            event_log: None,
            allow_other: false,
            ttl: DEFAULT_TTL,
        }
    }

    pub fn with_mount_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_path = Some(path.into());
        self
    }

    pub fn with_event_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.event_log = Some(path.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Check the backing root and normalise the config before mounting.
    ///
    /// The caching variant never writes through to the backing root, so it is
    /// always served read-only.
    pub fn validate(mut self) -> Result<Self> {
        let meta = std::fs::metadata(&self.backing_root).map_err(|e| {
            Error::InvalidBackingRoot(format!("{}: {e}", self.backing_root.display()))
        })?;
        if !meta.is_dir() {
            return Err(Error::InvalidBackingRoot(format!(
                "{} is not a directory",
                self.backing_root.display()
            ))
            .into());
        }
        self.backing_root = self.backing_root.canonicalize()?;

        if self.variant == MountVariant::Caching && !self.read_only {
            info!("caching mounts are served read-only");
            self.read_only = true;
        }
        Ok(self)
    }
}

/// Directory tree a mount lives in.
#[derive(Debug, Clone)]
pub struct MountLayout {
    pub mount_point: PathBuf,
    pub variant: MountVariant,
    /// True when the mount point was created here as a temporary directory.
    pub owned: bool,
}

impl MountLayout {
    /// Create (or adopt) the mount point and, for the caching variant, its
    /// `root/` and `cache/` sub-trees.
    pub fn prepare(config: &MountConfig) -> Result<Self> {
        let (mount_point, owned) = match &config.mount_path {
            Some(path) => (path.clone(), false),
            None => (
                std::env::temp_dir().join(format!(
                    "{}{}",
                    config.variant.temp_prefix(),
                    uuid::Uuid::new_v4().simple()
                )),
                true,
            ),
        };

        let mut dirs = vec![mount_point.clone()];
        if config.variant == MountVariant::Caching {
            dirs.push(mount_point.join(ROOT_FS));
            dirs.push(mount_point.join(CACHE_FS));
        }
        for dir in &dirs {
            if !dir.exists() {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(dir)?;
            }
        }

        let layout = Self {
            mount_point,
            variant: config.variant,
            owned,
        };
        layout.validate_serve_path()?;
        Ok(layout)
    }

    fn validate_serve_path(&self) -> Result<()> {
        let serve = self.serve_path();
        if !serve.is_dir() {
            return Err(Error::InvalidMountPath(serve.display().to_string()).into());
        }
        if std::fs::read_dir(&serve)?.next().is_some() {
            return Err(Error::InvalidMountPath(format!(
                "{} is not empty",
                serve.display()
            ))
            .into());
        }
        Ok(())
    }

    /// Directory the FUSE session is mounted on.
    pub fn serve_path(&self) -> PathBuf {
        match self.variant {
            MountVariant::Caching => self.mount_point.join(ROOT_FS),
            _ => self.mount_point.clone(),
        }
    }

    /// The view the workload runs against.
    pub fn root_fs(&self) -> PathBuf {
        self.serve_path()
    }

    pub fn cache_fs(&self) -> Option<PathBuf> {
        match self.variant {
            MountVariant::Caching => Some(self.mount_point.join(CACHE_FS)),
            _ => None,
        }
    }

    /// Rewrite an absolute host path into the mounted view. The path is
    /// appended below the root view, never substituted for it.
    pub fn mounted_path(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        let root = self.root_fs();
        if relative.as_os_str().is_empty() {
            root
        } else {
            root.join(relative)
        }
    }

    /// Remove the mount point tree. With `keep_cache` the caching variant's
    /// `cache/` sub-tree survives and only `root/` is removed.
    pub fn cleanup(&self, keep_cache: bool) -> Result<()> {
        let serve = self.serve_path();
        if mount::is_mounted(&serve) {
            return Err(Error::StillMounted(serve.display().to_string()).into());
        }

        if let (true, Some(cache)) = (keep_cache, self.cache_fs()) {
            info!(cache = %cache.display(), "keeping cache");
            return remove_tree(&self.root_fs());
        }

        info!(mount_point = %self.mount_point.display(), "cleaning up mount point");
        if self.owned {
            return remove_tree(&self.mount_point);
        }

        // Caller-provided mount points only lose what was created here.
        remove_tree(&self.root_fs())?;
        if let Some(cache) = self.cache_fs() {
            remove_tree(&cache)?;
        }
        match std::fs::remove_dir(&self.mount_point) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(mount_point = %self.mount_point.display(), error = %e, "mount point left in place");
                Ok(())
            }
        }
    }
}

fn remove_tree(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e).into()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountSessionState {
    Starting,
    Ready,
    Failed,
    Unmounted,
}

#[derive(Debug, Clone)]
pub struct MountSession {
    pub mount_id: uuid::Uuid,
    pub variant: MountVariant,
    pub mount_point: PathBuf,
    pub started_at: std::time::SystemTime,
    pub ended_at: Option<std::time::SystemTime>,
    pub state: MountSessionState,
    pub error: Option<String>,
}

impl MountSession {
    pub fn new(variant: MountVariant, mount_point: impl AsRef<Path>) -> Self {
        Self {
            mount_id: uuid::Uuid::new_v4(),
            variant,
            mount_point: mount_point.as_ref().to_path_buf(),
            started_at: std::time::SystemTime::now(),
            ended_at: None,
            state: MountSessionState::Starting,
            error: None,
        }
    }

    pub fn mark_ready(&mut self) {
        self.state = MountSessionState::Ready;
    }

    pub fn mark_failed(&mut self, msg: impl Into<String>) {
        self.state = MountSessionState::Failed;
        self.error = Some(msg.into());
        self.ended_at = Some(std::time::SystemTime::now());
    }

    pub fn mark_unmounted(&mut self) {
        self.state = MountSessionState::Unmounted;
        self.ended_at = Some(std::time::SystemTime::now());
    }
}

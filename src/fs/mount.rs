//! Mount manager: builds the loopback for a variant, serves it in the
//! background and tears the mount tree down afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use fuser::BackgroundSession;
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::{
    fs::{
        cache::CacheMaterializer,
        events::{EventLog, EventVerb},
        fuse,
        loopback::{LoopbackFs, MountStats},
        variant::{Caching, Interceptor, Passthrough, Recording},
        MountConfig, MountLayout, MountSession, MountSessionState, MountVariant,
    },
    logging::{log_mount_summary, MountSummary},
    Error, Result,
};

/// How often the serving loop checks that the mount is still present.
pub const UNMOUNT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal,
    ExternalUnmount,
    Requested,
}

/// One-shot shutdown latch. The first trigger wins; every waiter sees it.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    reason: Mutex<Option<ShutdownReason>>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when shutdown was already triggered.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let mut current = self.reason.lock();
        if current.is_some() {
            return false;
        }
        *current = Some(reason);
        self.condvar.notify_all();
        true
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock()
    }

    pub fn wait(&self) -> ShutdownReason {
        let mut current = self.reason.lock();
        loop {
            if let Some(reason) = *current {
                return reason;
            }
            self.condvar.wait(&mut current);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ShutdownReason> {
        let mut current = self.reason.lock();
        if current.is_none() {
            self.condvar.wait_for(&mut current, timeout);
        }
        *current
    }
}

/// A live mount of one variant.
pub struct MountHandle {
    config: MountConfig,
    layout: MountLayout,
    session: Mutex<MountSession>,
    events: EventLog,
    cache: Option<Arc<CacheMaterializer>>,
    stats: Arc<MountStats>,
    fuse: Mutex<Option<BackgroundSession>>,
    shutdown: Arc<ShutdownSignal>,
}

impl std::fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountHandle")
            .field("variant", &self.config.variant)
            .field("mount_point", &self.layout.mount_point)
            .field("state", &self.session.lock().state)
            .finish()
    }
}

impl MountHandle {
    /// Validate `config`, lay out the mount tree and start serving.
    pub fn start(config: MountConfig) -> Result<Self> {
        let config = config.validate()?;
        let layout = MountLayout::prepare(&config)?;
        let mut session = MountSession::new(config.variant, &layout.mount_point);
        let events = EventLog::from_config(config.event_log.as_deref());
        let stats = Arc::new(MountStats::default());
        let cache = layout
            .cache_fs()
            .map(|dir| Arc::new(CacheMaterializer::new(&config.backing_root, dir)));
        let serve = layout.serve_path();

        let spawned = match (config.variant, cache.clone()) {
            (MountVariant::Passthrough, _) => spawn_variant(&config, &serve, Passthrough, &stats),
            (MountVariant::Recording, _) => {
                spawn_variant(&config, &serve, Recording::new(events.clone()), &stats)
            }
            (MountVariant::Caching, Some(cache)) => {
                spawn_variant(&config, &serve, Caching::new(cache, events.clone()), &stats)
            }
            (MountVariant::Caching, None) => Err(Error::InvalidMountPath(format!(
                "{} has no cache directory",
                layout.mount_point.display()
            ))
            .into()),
        };

        let background = match spawned {
            Ok(background) => background,
            Err(err) => {
                session.mark_failed(err.to_string());
                if layout.owned {
                    if let Err(cleanup_err) = layout.cleanup(false) {
                        warn!(error = %cleanup_err, "failed to remove mount point after mount failure");
                    }
                }
                return Err(Error::MountFailed {
                    path: serve.display().to_string(),
                    reason: err.to_string(),
                }
                .into());
            }
        };

        session.mark_ready();
        info!(
            mount_id = %session.mount_id,
            variant = %config.variant,
            backing_root = %config.backing_root.display(),
            mount_point = %serve.display(),
            read_only = config.read_only,
            "mount ready"
        );

        Ok(Self {
            config,
            layout,
            session: Mutex::new(session),
            events,
            cache,
            stats,
            fuse: Mutex::new(Some(background)),
            shutdown: Arc::new(ShutdownSignal::new()),
        })
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    pub fn layout(&self) -> &MountLayout {
        &self.layout
    }

    pub fn variant(&self) -> MountVariant {
        self.config.variant
    }

    pub fn mount_id(&self) -> uuid::Uuid {
        self.session.lock().mount_id
    }

    pub fn state(&self) -> MountSessionState {
        self.session.lock().state
    }

    pub fn mount_point(&self) -> &Path {
        &self.layout.mount_point
    }

    /// Directory the FUSE session is attached to.
    pub fn serve_path(&self) -> PathBuf {
        self.layout.serve_path()
    }

    pub fn root_fs(&self) -> PathBuf {
        self.layout.root_fs()
    }

    pub fn cache_fs(&self) -> Option<PathBuf> {
        self.layout.cache_fs()
    }

    pub fn mounted_path(&self, path: &Path) -> PathBuf {
        self.layout.mounted_path(path)
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn cache(&self) -> Option<&Arc<CacheMaterializer>> {
        self.cache.as_ref()
    }

    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        self.shutdown.clone()
    }

    pub fn summary(&self) -> MountSummary {
        self.stats.summary(self.cache.as_deref())
    }

    /// Append the `Complete` event for a finished workload.
    pub fn record_complete(&self, command: &str, exit_code: i32) {
        self.events
            .record_str(EventVerb::Complete, command, Some(exit_code.into()));
    }

    /// Block until a shutdown is triggered or the mount disappears, then
    /// unmount.
    pub fn serve(&self) -> Result<ShutdownReason> {
        let watcher = {
            let shutdown = self.shutdown.clone();
            let serve = self.serve_path();
            std::thread::Builder::new()
                .name("compatfs-unmount-watch".into())
                .spawn(move || watch_external_unmount(&shutdown, &serve))?
        };

        let reason = self.shutdown.wait();
        match reason {
            ShutdownReason::Signal => {
                info!(mount_point = %self.serve_path().display(), "signal received; unmounting")
            }
            ShutdownReason::ExternalUnmount => {
                info!(mount_point = %self.serve_path().display(), "detected external unmount")
            }
            ShutdownReason::Requested => {}
        }
        if watcher.join().is_err() {
            warn!("unmount watcher panicked");
        }
        self.unmount()?;
        Ok(reason)
    }

    /// Detach the FUSE session. Calling it again is a no-op. A concurrent
    /// caller returns only once the first one has finished detaching.
    pub fn unmount(&self) -> Result<()> {
        self.shutdown.trigger(ShutdownReason::Requested);
        let mut fuse = self.fuse.lock();
        let Some(background) = fuse.take() else {
            return Ok(());
        };
        background.join();

        let mut session = self.session.lock();
        session.mark_unmounted();
        info!(mount_id = %session.mount_id, mount_point = %self.serve_path().display(), "unmounted");
        Ok(())
    }

    /// Unmount, remove the mount tree (keeping `cache/` when asked) and
    /// publish the event log.
    pub fn cleanup(&self, keep_cache: bool) -> Result<()> {
        self.unmount()?;
        let summary = self.summary();
        self.layout.cleanup(keep_cache)?;
        self.events.publish()?;
        if let Some(path) = self.events.path() {
            info!(
                events = %path.display(),
                written = self.events.events_written(),
                "event log complete"
            );
        }
        log_mount_summary(&self.mount_id(), summary);
        Ok(())
    }
}

fn spawn_variant<I: Interceptor>(
    config: &MountConfig,
    serve: &Path,
    interceptor: I,
    stats: &Arc<MountStats>,
) -> Result<BackgroundSession> {
    let fs = LoopbackFs::new(&config.backing_root, interceptor)?
        .read_only(config.read_only)
        .with_ttl(config.ttl)
        .with_stats(stats.clone());
    fuse::spawn(Arc::new(fs), serve, config.allow_other)
}

fn watch_external_unmount(shutdown: &ShutdownSignal, serve: &Path) {
    loop {
        if shutdown.wait_timeout(UNMOUNT_POLL_INTERVAL).is_some() {
            return;
        }
        if !is_mounted(serve) {
            shutdown.trigger(ShutdownReason::ExternalUnmount);
            return;
        }
    }
}

/// Check if a path is currently mounted (Linux-only, /proc/mounts).
pub fn is_mounted(path: &Path) -> bool {
    let Ok(contents) = fs::read_to_string("/proc/mounts") else {
        return false;
    };
    let target = path.to_string_lossy();
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|p| unescape_mount_field(p) == target)
}

/// `/proc/mounts` writes space, tab, newline and backslash as octal escapes.
pub fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(Ok(value)) = field.get(i + 1..i + 4).map(|d| u8::from_str_radix(d, 8)) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

//! Per-variant behaviour wrapped around the loopback calls.
//!
//! The loopback engine owns path resolution, identity and descriptor
//! handling; an [`Interceptor`] decides where an open really lands and what
//! gets recorded. The variant is picked once, when the mount is built.

use std::{
    io,
    os::unix::io::RawFd,
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::fs::{
    cache::CacheMaterializer,
    events::{EventLog, EventVerb},
    MountVariant,
};

pub trait Interceptor: Send + Sync + 'static {
    fn variant(&self) -> MountVariant;

    fn on_lookup(&self, _path: &Path) {}

    /// File to open for the backing path `original`.
    fn open_target(&self, original: &Path) -> io::Result<PathBuf> {
        Ok(original.to_path_buf())
    }

    fn on_open(&self, _path: &Path, _fid: RawFd) {}

    fn on_create(&self, _path: &Path, _fid: RawFd) {}

    /// `fid` is `None` when the handle could not be correlated.
    fn on_close(&self, _path: &Path, _fid: Option<RawFd>) {}

    fn cache(&self) -> Option<&Arc<CacheMaterializer>> {
        None
    }
}

/// Plain loopback.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Interceptor for Passthrough {
    fn variant(&self) -> MountVariant {
        MountVariant::Passthrough
    }
}

/// Loopback that writes every lookup, open, create and close to the event log.
#[derive(Debug, Clone)]
pub struct Recording {
    events: EventLog,
}

impl Recording {
    pub fn new(events: EventLog) -> Self {
        Self { events }
    }
}

impl Interceptor for Recording {
    fn variant(&self) -> MountVariant {
        MountVariant::Recording
    }

    fn on_lookup(&self, path: &Path) {
        self.events.record(EventVerb::Lookup, path, None);
    }

    fn on_open(&self, path: &Path, fid: RawFd) {
        self.events.record(EventVerb::Open, path, Some(fid.into()));
    }

    fn on_create(&self, path: &Path, fid: RawFd) {
        self.events.record(EventVerb::Create, path, Some(fid.into()));
    }

    fn on_close(&self, path: &Path, fid: Option<RawFd>) {
        self.events.record(EventVerb::Close, path, fid.map(Into::into));
    }
}

/// Loopback whose opens are served from a copy-on-access cache. Opens and
/// closes are recorded when an event log is configured.
#[derive(Debug, Clone)]
pub struct Caching {
    cache: Arc<CacheMaterializer>,
    events: EventLog,
}

impl Caching {
    pub fn new(cache: Arc<CacheMaterializer>, events: EventLog) -> Self {
        Self { cache, events }
    }
}

impl Interceptor for Caching {
    fn variant(&self) -> MountVariant {
        MountVariant::Caching
    }

    fn open_target(&self, original: &Path) -> io::Result<PathBuf> {
        self.cache.materialize(original)
    }

    fn on_open(&self, path: &Path, fid: RawFd) {
        self.events.record(EventVerb::Open, path, Some(fid.into()));
    }

    fn on_close(&self, path: &Path, fid: Option<RawFd>) {
        self.events.record(EventVerb::Close, path, fid.map(Into::into));
    }

    fn cache(&self) -> Option<&Arc<CacheMaterializer>> {
        Some(&self.cache)
    }
}

//! Copy-on-access cache behaviour.

use std::{fs, path::PathBuf, sync::Arc, thread};

use compatfs::fs::cache::CacheMaterializer;
use tempfile::tempdir;

fn backing_with_library() -> compatfs::Result<(tempfile::TempDir, PathBuf)> {
    let backing = tempdir()?;
    let lib = backing.path().join("lib/foo.so");
    fs::create_dir_all(lib.parent().expect("parent"))?;
    fs::write(&lib, vec![0x7f; 64 * 1024])?;
    Ok((backing, lib))
}

#[test]
fn first_open_copies_and_later_opens_reuse() -> compatfs::Result<()> {
    let (backing, lib) = backing_with_library()?;
    let cache_dir = tempdir()?;
    let cache = CacheMaterializer::new(backing.path(), cache_dir.path());

    let first = cache.materialize(&lib)?;
    let second = cache.materialize(&lib)?;

    assert_eq!(first, cache_dir.path().join("lib/foo.so"));
    assert_eq!(first, second);
    assert_eq!(fs::read(&first)?, fs::read(&lib)?);
    let stats = cache.stats();
    assert_eq!(stats.copies, 1);
    assert_eq!(stats.hits, 1);
    assert_eq!(cache.lookup(&lib), Some(first));
    Ok(())
}

#[test]
fn concurrent_first_opens_copy_once() -> compatfs::Result<()> {
    let (backing, lib) = backing_with_library()?;
    let cache_dir = tempdir()?;
    let cache = Arc::new(CacheMaterializer::new(backing.path(), cache_dir.path()));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let lib = lib.clone();
            thread::spawn(move || cache.materialize(&lib).expect("materialize"))
        })
        .collect();
    let paths: Vec<PathBuf> = workers
        .into_iter()
        .map(|w| w.join().expect("worker"))
        .collect();

    assert!(paths.iter().all(|p| p == &paths[0]));
    assert_eq!(cache.stats().copies, 1);
    assert_eq!(cache.list_cached_paths(), vec![PathBuf::from("lib/foo.so")]);
    assert_eq!(fs::read(&paths[0])?, fs::read(&lib)?);
    Ok(())
}

#[test]
fn cache_is_a_point_in_time_snapshot() -> compatfs::Result<()> {
    let (backing, lib) = backing_with_library()?;
    let cache_dir = tempdir()?;
    let cache = CacheMaterializer::new(backing.path(), cache_dir.path());

    let cached = cache.materialize(&lib)?;
    fs::write(&lib, b"changed")?;
    assert_eq!(cache.materialize(&lib)?, cached);
    assert_eq!(fs::read(&cached)?.len(), 64 * 1024);
    Ok(())
}

#[test]
fn kept_cache_from_a_previous_mount_is_reused() -> compatfs::Result<()> {
    let (backing, lib) = backing_with_library()?;
    let cache_dir = tempdir()?;

    CacheMaterializer::new(backing.path(), cache_dir.path()).materialize(&lib)?;

    let next = CacheMaterializer::new(backing.path(), cache_dir.path());
    next.materialize(&lib)?;
    let stats = next.stats();
    assert_eq!(stats.copies, 0);
    assert_eq!(stats.reused, 1);
    Ok(())
}

#[test]
fn directories_are_served_from_the_backing_root() -> compatfs::Result<()> {
    let (backing, lib) = backing_with_library()?;
    let cache_dir = tempdir()?;
    let cache = CacheMaterializer::new(backing.path(), cache_dir.path());

    let dir = lib.parent().expect("parent").to_path_buf();
    assert_eq!(cache.materialize(&dir)?, dir);
    assert!(cache.list_cached_paths().is_empty());
    Ok(())
}

#[test]
fn missing_original_is_an_error() -> compatfs::Result<()> {
    let backing = tempdir()?;
    let cache_dir = tempdir()?;
    let cache = CacheMaterializer::new(backing.path(), cache_dir.path());
    let err = cache
        .materialize(&backing.path().join("nope"))
        .expect_err("missing file");
    assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    assert_eq!(cache.stats().copies, 0);
    Ok(())
}

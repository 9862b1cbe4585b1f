//! Mount tree layout and cleanup, without mounting.

use std::{fs, path::Path};

use compatfs::{
    fs::{MountConfig, MountLayout, MountVariant, CACHE_FS, ROOT_FS},
    Error,
};
use tempfile::tempdir;

fn caching_layout(mount_path: &Path, backing: &Path) -> compatfs::Result<MountLayout> {
    let config = MountConfig::new(MountVariant::Caching, backing)
        .with_mount_path(mount_path)
        .validate()?;
    MountLayout::prepare(&config)
}

#[test]
fn caching_layout_has_root_and_cache_trees() -> compatfs::Result<()> {
    let backing = tempdir()?;
    let parent = tempdir()?;
    let mount_path = parent.path().join("slim");

    let layout = caching_layout(&mount_path, backing.path())?;
    assert_eq!(layout.serve_path(), mount_path.join(ROOT_FS));
    assert_eq!(layout.cache_fs(), Some(mount_path.join(CACHE_FS)));
    assert!(mount_path.join(ROOT_FS).is_dir());
    assert!(mount_path.join(CACHE_FS).is_dir());
    assert!(!layout.owned);
    Ok(())
}

#[test]
fn cleanup_without_keep_removes_the_mount_point() -> compatfs::Result<()> {
    let backing = tempdir()?;
    let parent = tempdir()?;
    let mount_path = parent.path().join("slim");

    let layout = caching_layout(&mount_path, backing.path())?;
    fs::create_dir_all(mount_path.join("cache/lib"))?;
    fs::write(mount_path.join("cache/lib/foo.so"), b"copy")?;

    layout.cleanup(false)?;
    assert!(!mount_path.exists());
    Ok(())
}

#[test]
fn cleanup_with_keep_spares_only_the_cache() -> compatfs::Result<()> {
    let backing = tempdir()?;
    let parent = tempdir()?;
    let mount_path = parent.path().join("slim");

    let layout = caching_layout(&mount_path, backing.path())?;
    fs::create_dir_all(mount_path.join("cache/lib"))?;
    fs::write(mount_path.join("cache/lib/foo.so"), b"copy")?;

    layout.cleanup(true)?;
    assert!(!mount_path.join(ROOT_FS).exists());
    assert_eq!(fs::read(mount_path.join("cache/lib/foo.so"))?, b"copy");

    // A later run can reuse the kept cache directory.
    let again = caching_layout(&mount_path, backing.path())?;
    assert!(again.serve_path().is_dir());
    Ok(())
}

#[test]
fn temporary_mount_points_are_created_and_removed() -> compatfs::Result<()> {
    let backing = tempdir()?;
    let config = MountConfig::new(MountVariant::Recording, backing.path()).validate()?;
    let layout = MountLayout::prepare(&config)?;

    assert!(layout.owned);
    assert!(layout.mount_point.starts_with(std::env::temp_dir()));
    let name = layout
        .mount_point
        .file_name()
        .expect("name")
        .to_string_lossy()
        .into_owned();
    assert!(name.starts_with("recordfs"));
    assert!(layout.mount_point.is_dir());

    layout.cleanup(false)?;
    assert!(!layout.mount_point.exists());
    Ok(())
}

#[test]
fn non_empty_mount_path_is_rejected() -> compatfs::Result<()> {
    let backing = tempdir()?;
    let target = tempdir()?;
    fs::write(target.path().join("occupied"), b"x")?;

    let config = MountConfig::new(MountVariant::Passthrough, backing.path())
        .with_mount_path(target.path())
        .validate()?;
    let err = MountLayout::prepare(&config).expect_err("non-empty target");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidMountPath(_))
    ));
    Ok(())
}

#[test]
fn validation_checks_backing_root_and_forces_read_only_cache() -> compatfs::Result<()> {
    let err = MountConfig::new(MountVariant::Passthrough, "/definitely/not/here")
        .validate()
        .expect_err("missing backing root");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidBackingRoot(_))
    ));

    let backing = tempdir()?;
    let file = backing.path().join("file");
    fs::write(&file, b"x")?;
    let err = MountConfig::new(MountVariant::Passthrough, &file)
        .validate()
        .expect_err("file as backing root");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidBackingRoot(_))
    ));

    let config = MountConfig::new(MountVariant::Caching, backing.path()).validate()?;
    assert!(config.read_only);
    let config = MountConfig::new(MountVariant::Recording, backing.path()).validate()?;
    assert!(!config.read_only);
    Ok(())
}

#[test]
fn mounted_path_is_appended_below_the_root_view() -> compatfs::Result<()> {
    let backing = tempdir()?;
    let parent = tempdir()?;
    let mount_path = parent.path().join("slim");
    let layout = caching_layout(&mount_path, backing.path())?;

    assert_eq!(
        layout.mounted_path(Path::new("/usr/bin/python3")),
        mount_path.join("root/usr/bin/python3")
    );
    assert_eq!(layout.mounted_path(Path::new("/")), mount_path.join(ROOT_FS));
    assert_eq!(
        layout.mounted_path(Path::new("relative/tool")),
        mount_path.join("root/relative/tool")
    );
    Ok(())
}

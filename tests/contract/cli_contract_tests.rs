//! CLI contract tests for compatfs argument validation.

use compatfs::Error;
use tempfile::tempdir;

fn expect_error(args: &[&str], expected: Error) {
    let err = compatfs::run(args.iter().copied()).expect_err("command should fail");
    let actual = err
        .downcast_ref::<Error>()
        .unwrap_or_else(|| panic!("unexpected error type: {err:?}"));
    match expected {
        Error::Cli(ref expected_msg) => {
            assert!(
                matches!(actual, Error::Cli(msg) if msg == expected_msg),
                "got {actual:?}"
            );
        }
        _ => {
            assert_eq!(
                std::mem::discriminant(actual),
                std::mem::discriminant(&expected),
                "got {actual:?}"
            );
        }
    }
}

#[test]
fn record_and_slim_require_a_command() {
    expect_error(
        &["compatfs", "record"],
        Error::Cli("command is required".into()),
    );
    expect_error(
        &["compatfs", "slim", "--keep"],
        Error::Cli("command is required".into()),
    );
}

#[test]
fn libs_requires_an_elf_binary() {
    expect_error(
        &["compatfs", "libs"],
        Error::Cli("binary is required".into()),
    );

    let dir = tempdir().unwrap();
    let script = dir.path().join("run.sh");
    std::fs::write(&script, b"#!/bin/sh\nexit 0\n").unwrap();
    expect_error(
        &["compatfs", "libs", "--binary", script.to_str().unwrap()],
        Error::ElfParse {
            path: String::new(),
            reason: String::new(),
        },
    );
}

#[test]
fn libs_writes_an_artifact_for_a_real_executable() {
    let exe = std::env::current_exe().unwrap();
    let dir = tempdir().unwrap();
    let out = dir.path().join("compat.json");

    compatfs::run([
        "compatfs",
        "libs",
        "--binary",
        exe.to_str().unwrap(),
        "--out",
        out.to_str().unwrap(),
    ])
    .unwrap();

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    let name = exe.file_name().unwrap().to_str().unwrap();
    assert_eq!(
        json["attributes"]["llnl.compatlib.executable-name"],
        serde_json::Value::from(name)
    );
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn unmount_requires_a_mounted_path() {
    expect_error(
        &["compatfs", "unmount"],
        Error::Cli("mnt_path is required".into()),
    );
    expect_error(
        &["compatfs", "unmount", "--mnt-path", "/no/such/path"],
        Error::InvalidMountPath(String::new()),
    );

    let idle = tempdir().unwrap();
    expect_error(
        &["compatfs", "unmount", "--mnt-path", idle.path().to_str().unwrap()],
        Error::NotMounted(String::new()),
    );
}

#[test]
fn mount_validates_paths_before_mounting() {
    expect_error(
        &["compatfs", "mount", "--backing-root", "/no/such/root"],
        Error::InvalidBackingRoot(String::new()),
    );

    let backing = tempdir().unwrap();
    let target = tempdir().unwrap();
    std::fs::write(target.path().join("keep.txt"), b"occupied").unwrap();
    expect_error(
        &[
            "compatfs",
            "mount",
            "--backing-root",
            backing.path().to_str().unwrap(),
            "--mount-path",
            target.path().to_str().unwrap(),
        ],
        Error::InvalidMountPath(String::new()),
    );
    assert!(target.path().join("keep.txt").exists());
}

#[test]
fn slim_mount_path_with_busy_root_is_rejected() {
    let backing = tempdir().unwrap();
    let target = tempdir().unwrap();
    std::fs::create_dir(target.path().join("root")).unwrap();
    std::fs::write(target.path().join("root/stale"), b"x").unwrap();

    let err = compatfs::run([
        "compatfs",
        "slim",
        "--backing-root",
        backing.path().to_str().unwrap(),
        "--mount-path",
        target.path().to_str().unwrap(),
        "--",
        "/bin/true",
    ])
    .expect_err("non-empty root/ must fail");
    // Without proot installed the run stops even earlier.
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::InvalidMountPath(_)) | Some(Error::MissingTool(_))
    ));
}

#[test]
fn help_lists_every_subcommand() {
    let cmd = compatfs::cli::clap_command();
    cmd.clone().debug_assert();
    let names: Vec<_> = cmd.get_subcommands().map(|s| s.get_name().to_string()).collect();
    for expected in ["mount", "record", "slim", "libs", "unmount"] {
        assert!(names.iter().any(|n| n == expected), "missing {expected}");
    }
}

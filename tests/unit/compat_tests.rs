//! Compatibility artifact and dependency scan.

use std::{collections::HashSet, path::Path};

use compatfs::{
    compat::{generate_library_artifact, CompatibilitySpec, EXECUTABLE_NAME_KEY},
    deps::{find_shared_libs, read_elf, LibraryResolver},
    Error,
};
use tempfile::tempdir;

#[test]
fn artifact_names_executable_by_base_name_and_numbers_libraries() {
    let artifact = generate_library_artifact(
        Path::new("/usr/local/bin/solver"),
        &["libm.so.6", "libc.so.6"],
    );
    assert_eq!(artifact.attributes[EXECUTABLE_NAME_KEY], "solver");
    assert_eq!(
        artifact.attributes["llnl.compatlib.library-name.0"],
        "libm.so.6"
    );
    assert_eq!(
        artifact.attributes["llnl.compatlib.library-name.1"],
        "libc.so.6"
    );
    assert_eq!(artifact.attributes.len(), 3);
    assert_eq!(artifact.version, env!("CARGO_PKG_VERSION"));
}

#[test]
fn artifact_json_is_two_space_indented() -> compatfs::Result<()> {
    let mut artifact = CompatibilitySpec::new();
    artifact.version = "0.0.1".into();
    artifact.add_attribute(EXECUTABLE_NAME_KEY, "app");
    assert_eq!(
        artifact.to_json()?,
        "{\n  \"version\": \"0.0.1\",\n  \"attributes\": {\n    \"llnl.compatlib.executable-name\": \"app\"\n  }\n}"
    );

    let parsed: CompatibilitySpec = serde_json::from_str(&artifact.to_json()?)?;
    assert_eq!(parsed, artifact);
    Ok(())
}

#[test]
fn scanning_a_non_elf_file_fails_with_parse_error() -> compatfs::Result<()> {
    let dir = tempdir()?;
    let script = dir.path().join("run.sh");
    std::fs::write(&script, b"#!/bin/sh\nexit 0\n")?;
    let err = find_shared_libs(&script, &LibraryResolver::from_env()).expect_err("not ELF");
    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::ElfParse { .. })
    ));
    Ok(())
}

#[test]
fn scan_of_this_test_binary_yields_unique_existing_paths() -> compatfs::Result<()> {
    let exe = std::env::current_exe()?;
    assert!(read_elf(&exe)?.soname.is_none());
    let libs = find_shared_libs(&exe, &LibraryResolver::from_env())?;

    let mut seen = HashSet::new();
    for lib in &libs {
        assert!(lib.is_absolute(), "{} is not absolute", lib.display());
        assert!(lib.is_file(), "{} does not exist", lib.display());
        assert!(seen.insert(lib.clone()), "{} listed twice", lib.display());
    }
    Ok(())
}

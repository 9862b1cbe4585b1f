//! Shared-library dependency scan of an ELF executable.
//!
//! Walks `DT_NEEDED` breadth-first the way the dynamic loader would look the
//! libraries up, then reads each library's `DT_SONAME`.

use std::{
    collections::{HashSet, VecDeque},
    path::{Path, PathBuf},
};

use goblin::elf::Elf;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Directories searched after everything the binary and environment name.
pub const DEFAULT_LIBRARY_DIRS: &[&str] = &[
    "/lib64",
    "/usr/lib64",
    "/lib",
    "/usr/lib",
    "/lib/x86_64-linux-gnu",
    "/usr/lib/x86_64-linux-gnu",
    "/lib/aarch64-linux-gnu",
    "/usr/lib/aarch64-linux-gnu",
    "/usr/local/lib",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfInfo {
    pub soname: Option<String>,
    pub needed: Vec<String>,
    pub rpaths: Vec<String>,
    pub runpaths: Vec<String>,
    pub is_64: bool,
    pub machine: u16,
}

pub fn read_elf(path: &Path) -> Result<ElfInfo> {
    let bytes = std::fs::read(path)?;
    let elf = Elf::parse(&bytes).map_err(|e| Error::ElfParse {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    Ok(ElfInfo {
        soname: elf.soname.map(str::to_string),
        needed: elf.libraries.iter().map(|s| s.to_string()).collect(),
        rpaths: split_search_list(&elf.rpaths),
        runpaths: split_search_list(&elf.runpaths),
        is_64: elf.is_64,
        machine: elf.header.e_machine,
    })
}

fn split_search_list(entries: &[&str]) -> Vec<String> {
    entries
        .iter()
        .flat_map(|e| e.split(':'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn read_soname(path: &Path) -> Result<Option<String>> {
    Ok(read_elf(path)?.soname)
}

/// Library search order: `DT_RPATH` (ignored when `DT_RUNPATH` is set),
/// `LD_LIBRARY_PATH`, `DT_RUNPATH`, then the default directories.
#[derive(Debug, Clone)]
pub struct LibraryResolver {
    ld_library_path: Vec<PathBuf>,
    default_dirs: Vec<PathBuf>,
}

impl LibraryResolver {
    pub fn new(ld_library_path: Vec<PathBuf>, default_dirs: Vec<PathBuf>) -> Self {
        Self {
            ld_library_path,
            default_dirs,
        }
    }

    pub fn from_env() -> Self {
        let ld_library_path = std::env::var_os("LD_LIBRARY_PATH")
            .map(|v| std::env::split_paths(&v).filter(|p| !p.as_os_str().is_empty()).collect())
            .unwrap_or_default();
        let default_dirs = DEFAULT_LIBRARY_DIRS.iter().map(PathBuf::from).collect();
        Self::new(ld_library_path, default_dirs)
    }

    fn search_dirs(&self, requester: &Path, info: &ElfInfo) -> Vec<PathBuf> {
        let origin = requester.parent().unwrap_or(Path::new("/"));
        let expand = |entry: &String| {
            PathBuf::from(
                entry
                    .replace("${ORIGIN}", &origin.to_string_lossy())
                    .replace("$ORIGIN", &origin.to_string_lossy()),
            )
        };

        let mut dirs = Vec::new();
        if info.runpaths.is_empty() {
            dirs.extend(info.rpaths.iter().map(expand));
        }
        dirs.extend(self.ld_library_path.iter().cloned());
        dirs.extend(info.runpaths.iter().map(expand));
        dirs.extend(self.default_dirs.iter().cloned());
        dirs
    }

    /// Find `name` as needed by `requester`; candidates of another ELF class
    /// or machine are passed over.
    pub fn resolve(&self, name: &str, requester: &Path, info: &ElfInfo) -> Option<PathBuf> {
        if name.contains('/') {
            let path = PathBuf::from(name);
            return path.is_file().then_some(path);
        }
        self.search_dirs(requester, info)
            .into_iter()
            .map(|dir| dir.join(name))
            .filter(|candidate| candidate.is_file())
            .find(|candidate| match read_elf(candidate) {
                Ok(lib) => lib.is_64 == info.is_64 && lib.machine == info.machine,
                Err(_) => false,
            })
    }
}

/// Every shared library `binary` pulls in, transitively, in discovery
/// order. Paths are canonical; each appears once.
pub fn find_shared_libs(binary: &Path, resolver: &LibraryResolver) -> Result<Vec<PathBuf>> {
    let root = read_elf(binary)?;
    let mut seen_names = HashSet::new();
    let mut seen_paths = HashSet::new();
    let mut found = Vec::new();
    let mut queue = VecDeque::from([(binary.to_path_buf(), root)]);

    while let Some((requester, info)) = queue.pop_front() {
        for name in &info.needed {
            if !seen_names.insert(name.clone()) {
                continue;
            }
            let Some(path) = resolver.resolve(name, &requester, &info) else {
                warn!(library = %name, needed_by = %requester.display(), "library not found");
                continue;
            };
            let path = path.canonicalize().unwrap_or(path);
            if !seen_paths.insert(path.clone()) {
                continue;
            }
            debug!(library = %name, path = %path.display(), "resolved");
            match read_elf(&path) {
                Ok(lib) => queue.push_back((path.clone(), lib)),
                Err(err) => warn!(path = %path.display(), error = %err, "cannot parse library"),
            }
            found.push(path);
        }
    }
    Ok(found)
}

/// Sonames of the libraries `binary` needs. A library without `DT_SONAME`
/// is listed by file name; unreadable ones are skipped.
pub fn find_sonames(binary: &Path, resolver: &LibraryResolver) -> Result<Vec<String>> {
    let mut sonames = Vec::new();
    for path in find_shared_libs(binary, resolver)? {
        match read_soname(&path) {
            Ok(Some(soname)) => sonames.push(soname),
            Ok(None) => {
                if let Some(name) = path.file_name() {
                    sonames.push(name.to_string_lossy().into_owned());
                }
            }
            Err(err) => warn!(path = %path.display(), error = %err, "cannot read soname"),
        }
    }
    Ok(sonames)
}

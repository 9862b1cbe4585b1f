//! Compatibility artifact describing an executable and the libraries it
//! needs.

use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};

use crate::Result;

pub const EXECUTABLE_NAME_KEY: &str = "llnl.compatlib.executable-name";
pub const LIBRARY_NAME_KEY_PREFIX: &str = "llnl.compatlib.library-name";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilitySpec {
    pub version: String,
    pub attributes: BTreeMap<String, String>,
}

impl Default for CompatibilitySpec {
    fn default() -> Self {
        Self::new()
    }
}

impl CompatibilitySpec {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Two-space indented JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Artifact for `executable` (recorded by base name) and its libraries,
/// numbered in the order given.
pub fn generate_library_artifact<S: AsRef<str>>(executable: &Path, libraries: &[S]) -> CompatibilitySpec {
    let mut artifact = CompatibilitySpec::new();
    let name = executable
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable.display().to_string());
    artifact.add_attribute(EXECUTABLE_NAME_KEY, name);
    for (i, lib) in libraries.iter().enumerate() {
        artifact.add_attribute(format!("{LIBRARY_NAME_KEY_PREFIX}.{i}"), lib.as_ref());
    }
    artifact
}

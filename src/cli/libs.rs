//! Implementation of `compatfs libs` subcommand.

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use crate::{
    compat::generate_library_artifact,
    deps::{find_sonames, LibraryResolver},
    Error, Result,
};

#[derive(Debug, Clone, Args)]
pub struct LibsArgs {
    /// ELF executable to inspect
    #[arg(long = "binary")]
    pub binary: Option<PathBuf>,

    /// Write the compatibility artifact here instead of stdout
    #[arg(long = "out")]
    pub out: Option<PathBuf>,
}

pub fn execute(args: LibsArgs) -> Result<()> {
    let binary = args
        .binary
        .ok_or_else(|| Error::Cli("binary is required".into()))?;
    if !binary.is_file() {
        return Err(Error::Cli(format!("{} is not a file", binary.display())).into());
    }

    info!(binary = %binary.display(), "finding shared libraries");
    let sonames = find_sonames(&binary, &LibraryResolver::from_env())?;
    for soname in &sonames {
        println!("{soname}");
    }

    let json = generate_library_artifact(&binary, &sonames).to_json()?;
    match args.out {
        Some(out) => {
            std::fs::write(&out, format!("{json}\n"))?;
            info!(artifact = %out.display(), libraries = sonames.len(), "artifact written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

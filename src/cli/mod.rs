//! Command-line front end; one module per subcommand.

use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::warn;

use crate::{
    fs::mount::{MountHandle, ShutdownReason},
    Error, Result,
};

pub mod libs;
pub mod mount;
pub mod record;
pub mod slim;
pub mod unmount;

#[derive(Debug, Clone)]
pub enum Command {
    Mount(mount::MountArgs),
    Record(record::RecordArgs),
    Slim(slim::SlimArgs),
    Libs(libs::LibsArgs),
    Unmount(unmount::UnmountArgs),
    None,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub command: Command,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            command: Command::None,
        }
    }
}

pub fn dispatch(args: CliArgs) -> Result<()> {
    match args.command {
        Command::Mount(m) => mount::execute(m),
        Command::Record(r) => record::execute(r),
        Command::Slim(s) => slim::execute(s),
        Command::Libs(l) => libs::execute(l),
        Command::Unmount(u) => unmount::execute(u),
        Command::None => Ok(()),
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "compatfs",
    version,
    about = "FUSE loopback that records file access and slims execution roots"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Subcommands>,
}

#[derive(Subcommand, Debug)]
enum Subcommands {
    /// Mount a passthrough loopback of a directory; optionally run a command
    /// against it, then serve until interrupted.
    Mount(mount::MountArgs),
    /// Run a command on a recording mount and write every file access to an
    /// event log.
    Record(record::RecordArgs),
    /// Run a command rooted in a caching mount; every file it opens is copied
    /// into the mount's cache directory.
    Slim(slim::SlimArgs),
    /// List the shared libraries an executable needs and print a
    /// compatibility artifact.
    Libs(libs::LibsArgs),
    /// Unmount a compatfs mount left behind by another process.
    Unmount(unmount::UnmountArgs),
}

/// Parse CLI arguments into internal representation.
pub fn parse_args<I, S>(args: I) -> Result<CliArgs>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let argv: Vec<String> = args.into_iter().map(Into::into).collect();
    let cli = Cli::parse_from(argv);
    let command = match cli.command {
        Some(Subcommands::Mount(args)) => Command::Mount(args),
        Some(Subcommands::Record(args)) => Command::Record(args),
        Some(Subcommands::Slim(args)) => Command::Slim(args),
        Some(Subcommands::Libs(args)) => Command::Libs(args),
        Some(Subcommands::Unmount(args)) => Command::Unmount(args),
        None => Command::None,
    };

    Ok(CliArgs { command })
}

/// Build the underlying clap `Command` (useful for help/usage contract tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}

/// Unmount on SIGINT/SIGTERM. The handler runs on its own thread, so it may
/// race the normal completion path; unmounting is idempotent.
pub(crate) fn install_shutdown_handler(handle: &Arc<MountHandle>) -> Result<()> {
    let handle = handle.clone();
    ctrlc::set_handler(move || {
        handle.shutdown_signal().trigger(ShutdownReason::Signal);
        if let Err(err) = handle.unmount() {
            warn!(error = %err, "unmount after signal failed");
        }
    })
    .map_err(|e| Error::Cli(format!("failed to install signal handler: {e}")))?;
    Ok(())
}

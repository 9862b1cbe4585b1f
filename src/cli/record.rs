//! Implementation of `compatfs record` subcommand.

use std::{path::PathBuf, sync::Arc};

use clap::Args;
use tracing::{info, instrument};

use crate::{
    fs::{
        events::create_event_file, mount::MountHandle, MountConfig, MountVariant,
        DEFAULT_BACKING_ROOT,
    },
    runner::{self, Invocation},
    Error, Result,
};

#[derive(Debug, Clone, Args)]
pub struct RecordArgs {
    /// Directory to serve through the mount
    #[arg(long = "backing-root", default_value = DEFAULT_BACKING_ROOT)]
    pub backing_root: PathBuf,

    /// Empty directory to mount on (a temporary one is created when unset)
    #[arg(long = "mount-path")]
    pub mount_path: Option<PathBuf>,

    /// Event log to write
    #[arg(long = "out")]
    pub out: Option<PathBuf>,

    /// Directory for a generated event log when --out is not given
    #[arg(long = "out-dir")]
    pub out_dir: Option<PathBuf>,

    /// Reject every write through the mount
    #[arg(long = "read-only")]
    pub read_only: bool,

    /// Keep serving after the command ends, until interrupted
    #[arg(long = "wait")]
    pub wait: bool,

    /// Command to record, with its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

pub fn execute(args: RecordArgs) -> Result<()> {
    if args.command.is_empty() {
        return Err(Error::Cli("command is required".into()).into());
    }
    let proot = runner::locate_proot()?;

    let out = match &args.out {
        Some(out) => out.clone(),
        None => create_event_file(args.out_dir.as_deref())?,
    };
    info!(events = %out.display(), "recording file access");

    let mut config = MountConfig::new(MountVariant::Recording, &args.backing_root)
        .with_event_log(&out)
        .read_only(args.read_only);
    config.mount_path = args.mount_path.clone();

    let handle = Arc::new(MountHandle::start(config)?);
    super::install_shutdown_handler(&handle)?;

    let outcome = record(&handle, &proot, &args.command);
    let served = if args.wait && outcome.is_ok() {
        info!(mount_point = %handle.serve_path().display(), "waiting; press Ctrl+C to unmount");
        handle.serve().map(|_| ())
    } else {
        Ok(())
    };
    handle.cleanup(false)?;
    served?;
    runner::check_exit(&args.command.join(" "), outcome?)
}

#[instrument(skip(handle, proot))]
fn record(handle: &MountHandle, proot: &std::path::Path, command: &[String]) -> Result<i32> {
    let invocation = Invocation::from_argv(command)?;
    let display = invocation.to_string();
    let invocation = invocation.under_proot(proot, runner::overlay_options(handle.mount_point()));
    let code = invocation.run(None)?;
    handle.record_complete(&display, code);
    info!(code, "command is done running");
    Ok(code)
}

//! Implementation of `compatfs mount` subcommand.

use std::{path::PathBuf, sync::Arc};

use clap::Args;
use tracing::{info, instrument};

use crate::{
    fs::{mount::MountHandle, MountConfig, MountVariant, DEFAULT_BACKING_ROOT},
    runner::{self, Invocation},
    Result,
};

#[derive(Debug, Clone, Args)]
pub struct MountArgs {
    /// Directory to serve through the mount
    #[arg(long = "backing-root", default_value = DEFAULT_BACKING_ROOT)]
    pub backing_root: PathBuf,

    /// Empty directory to mount on (a temporary one is created when unset)
    #[arg(long = "mount-path")]
    pub mount_path: Option<PathBuf>,

    /// Reject every write through the mount
    #[arg(long = "read-only")]
    pub read_only: bool,

    /// Let other users access the mount (needs user_allow_other)
    #[arg(long = "allow-other")]
    pub allow_other: bool,

    /// Command to run inside the mount before serving
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl MountArgs {
    pub fn to_config(&self) -> MountConfig {
        let mut config = MountConfig::new(MountVariant::Passthrough, &self.backing_root)
            .read_only(self.read_only);
        config.mount_path = self.mount_path.clone();
        config.allow_other = self.allow_other;
        config
    }
}

pub fn execute(args: MountArgs) -> Result<()> {
    let handle = Arc::new(MountHandle::start(args.to_config())?);
    super::install_shutdown_handler(&handle)?;

    let outcome = run_command(&handle, &args.command);
    let served = match &outcome {
        Ok(_) => {
            info!(mount_point = %handle.serve_path().display(), "compatfs mount active; press Ctrl+C to unmount");
            handle.serve().map(|_| ())
        }
        Err(_) => Ok(()),
    };
    handle.cleanup(false)?;
    served?;
    match outcome? {
        Some(code) => runner::check_exit(&args.command.join(" "), code),
        None => Ok(()),
    }
}

/// Run the optional command with the mount laid over `/`.
#[instrument(skip(handle))]
fn run_command(handle: &MountHandle, command: &[String]) -> Result<Option<i32>> {
    if command.is_empty() {
        return Ok(None);
    }
    let proot = runner::locate_proot()?;
    let invocation = Invocation::from_argv(command)?
        .under_proot(&proot, runner::overlay_options(handle.mount_point()));
    let code = invocation.run(None)?;
    info!(code, "command is done running");
    Ok(Some(code))
}

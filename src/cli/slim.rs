//! Implementation of `compatfs slim` subcommand.

use std::{path::PathBuf, sync::Arc};

use clap::{ArgAction, Args};
use tracing::{info, instrument, warn};

use crate::{
    fs::{mount::MountHandle, MountConfig, MountVariant, DEFAULT_BACKING_ROOT},
    runner::{self, Invocation},
    Error, Result,
};

#[derive(Debug, Clone, Args)]
pub struct SlimArgs {
    /// Directory to serve through the mount
    #[arg(long = "backing-root", default_value = DEFAULT_BACKING_ROOT)]
    pub backing_root: PathBuf,

    /// Directory holding the root/ and cache/ trees (temporary when unset)
    #[arg(long = "mount-path")]
    pub mount_path: Option<PathBuf>,

    /// Working directory for the command (defaults to the current one)
    #[arg(long = "workdir")]
    pub workdir: Option<PathBuf>,

    /// Keep serving after the command ends, until interrupted
    #[arg(long = "wait")]
    pub wait: bool,

    /// Serve the mount read-only; caching mounts are always read-only
    #[arg(long = "read-only", action = ArgAction::Set, default_value_t = true)]
    pub read_only: bool,

    /// Run proot verbosely
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Event log of opens and closes (nothing is recorded when unset)
    #[arg(long = "out")]
    pub out: Option<PathBuf>,

    /// Keep the cache directory after the mount ends
    #[arg(long = "keep")]
    pub keep: bool,

    /// Command to run, with its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl SlimArgs {
    pub fn to_config(&self) -> MountConfig {
        let mut config = MountConfig::new(MountVariant::Caching, &self.backing_root)
            .read_only(self.read_only);
        config.mount_path = self.mount_path.clone();
        config.event_log = self.out.clone();
        config
    }
}

pub fn execute(args: SlimArgs) -> Result<()> {
    let (program, rest) = args
        .command
        .split_first()
        .ok_or_else(|| Error::Cli("command is required".into()))?;
    let program = runner::full_path(program)?;
    let proot = runner::locate_proot()?;
    let workdir = match &args.workdir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    if !args.read_only {
        warn!("caching mounts ignore --read-only=false");
    }

    let handle = Arc::new(MountHandle::start(args.to_config())?);
    info!(
        verbose = args.verbose,
        keep_cache = args.keep,
        cache = ?handle.cache_fs(),
        root = %handle.root_fs().display(),
        program = %program.display(),
        mounted_program = %handle.mounted_path(&program).display(),
        "slim mount ready"
    );
    super::install_shutdown_handler(&handle)?;

    let mut argv = vec![program.display().to_string()];
    argv.extend(rest.iter().cloned());
    let outcome = run_rooted(&handle, &proot, &argv, &workdir, args.verbose);
    let served = if args.wait && outcome.is_ok() {
        info!(root = %handle.root_fs().display(), "waiting; press Ctrl+C to unmount");
        handle.serve().map(|_| ())
    } else {
        Ok(())
    };
    handle.cleanup(args.keep)?;
    served?;
    runner::check_exit(&argv.join(" "), outcome?)
}

/// The mount's `root/` view becomes `/`, so `argv[0]` keeps its host path.
#[instrument(skip(handle, proot))]
fn run_rooted(
    handle: &MountHandle,
    proot: &std::path::Path,
    argv: &[String],
    workdir: &std::path::Path,
    verbose: bool,
) -> Result<i32> {
    let invocation = Invocation::from_argv(argv)?;
    let display = invocation.to_string();
    let options = runner::rooted_options(&handle.root_fs(), workdir, verbose);
    let code = invocation.under_proot(proot, options).run(Some(workdir))?;
    handle.record_complete(&display, code);
    info!(code, "command is done running");
    Ok(code)
}

//! Running a workload against a mount through `proot`.
//!
//! Recording runs bind the mount over `/` (`-S <mount> -0`); caching runs use
//! the mount's `root/` view as the new root (`-R`). Either way the child
//! inherits stdio and runs from the caller's working directory.

use std::{
    ffi::{OsStr, OsString},
    fmt,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::Command,
};

use tracing::{debug, info};

use crate::{Error, Result};

pub const PROOT: &str = "proot";

/// Resolve `proot` on `PATH`.
pub fn locate_proot() -> Result<PathBuf> {
    which::which(PROOT).map_err(|_| Error::MissingTool(PROOT.to_string()).into())
}

/// Absolute path of `program`: names containing a separator are taken
/// relative to the working directory, bare names are searched on `PATH`.
pub fn full_path(program: &str) -> Result<PathBuf> {
    if program.contains('/') {
        let path = Path::new(program);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        return Ok(std::env::current_dir()?.join(path));
    }
    which::which(program).map_err(|_| Error::MissingTool(program.to_string()).into())
}

/// Program plus arguments, ready to become a `Command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl Invocation {
    /// Split a user argv; the first word is the program.
    pub fn from_argv<S: AsRef<OsStr>>(argv: &[S]) -> Result<Self> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| Error::Cli("a command to run is required".into()))?;
        Ok(Self {
            program: PathBuf::from(program.as_ref()),
            args: rest.iter().map(|a| a.as_ref().to_os_string()).collect(),
        })
    }

    /// Wrap this invocation as the command run by `proot` with `options`.
    pub fn under_proot(self, proot: &Path, options: Vec<OsString>) -> Invocation {
        let mut args = options;
        args.push(self.program.into_os_string());
        args.extend(self.args);
        Invocation {
            program: proot.to_path_buf(),
            args,
        }
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Run to completion with inherited stdio and return the exit code.
    /// A child killed by a signal reports `128 + signo`.
    pub fn run(&self, workdir: Option<&Path>) -> Result<i32> {
        let mut cmd = self.to_command();
        if let Some(dir) = workdir {
            cmd.current_dir(dir);
        }
        info!(command = %self, "running workload");
        let status = cmd
            .status()
            .map_err(|e| Error::WorkloadNotStarted(format!("{self}: {e}")))?;
        let code = status
            .code()
            .or_else(|| status.signal().map(|signo| 128 + signo))
            .unwrap_or(-1);
        debug!(command = %self, code, "workload finished");
        Ok(code)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// `proot` options that overlay `mount_point` on `/` as fake root.
pub fn overlay_options(mount_point: &Path) -> Vec<OsString> {
    vec![
        "-S".into(),
        mount_point.as_os_str().to_os_string(),
        "-0".into(),
    ]
}

/// `proot` options that make `root` the new `/` and start in `workdir`.
pub fn rooted_options(root: &Path, workdir: &Path, verbose: bool) -> Vec<OsString> {
    let mut options: Vec<OsString> = Vec::new();
    if verbose {
        options.extend(["-v".into(), "1".into()]);
    }
    options.extend([
        "-R".into(),
        root.as_os_str().to_os_string(),
        "--kill-on-exit".into(),
        "-w".into(),
        workdir.as_os_str().to_os_string(),
    ]);
    options
}

/// Turn a non-zero exit code into `WorkloadFailed`.
pub fn check_exit(command: &str, code: i32) -> Result<()> {
    if code == 0 {
        return Ok(());
    }
    Err(Error::WorkloadFailed {
        command: command.to_string(),
        status: format!("exit code {code}"),
    }
    .into())
}

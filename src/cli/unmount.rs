//! Implementation of `compatfs unmount` subcommand.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use clap::Args;
use tracing::info;

use crate::{fs::mount::is_mounted, Error, Result};

#[derive(Debug, Clone, Args)]
pub struct UnmountArgs {
    /// Path of a live compatfs mount (for slim mounts, the root/ directory)
    #[arg(long = "mnt-path")]
    pub mnt_path: Option<PathBuf>,
}

pub fn execute(args: UnmountArgs) -> Result<()> {
    let mnt_path = args
        .mnt_path
        .ok_or_else(|| Error::Cli("mnt_path is required".into()))?;
    if !mnt_path.is_dir() {
        return Err(Error::InvalidMountPath(mnt_path.display().to_string()).into());
    }
    if !is_mounted(&mnt_path) {
        return Err(Error::NotMounted(mnt_path.display().to_string()).into());
    }
    system_unmount(&mnt_path)?;
    info!(mount_point = %mnt_path.display(), "unmounted");
    Ok(())
}

/// Execute an OS-level unmount. Tries `fusermount -u` first, then `umount`.
pub fn system_unmount(mnt_path: &Path) -> Result<()> {
    let path_string = mnt_path.to_string_lossy().to_string();
    let candidates = [
        ("fusermount", vec!["-u", path_string.as_str()]),
        ("fusermount3", vec!["-u", path_string.as_str()]),
        ("umount", vec![path_string.as_str()]),
    ];

    let mut saw_not_mounted = false;
    let mut last_stderr: Option<String> = None;

    for (cmd, args) in candidates {
        match Command::new(cmd).args(args).output() {
            Ok(output) => {
                if output.status.success() {
                    return Ok(());
                }

                let stderr = String::from_utf8_lossy(&output.stderr).to_string();
                let stderr_lower = stderr.to_lowercase();

                if stderr_lower.contains("not mounted")
                    || stderr_lower.contains("not found in /etc/mtab")
                {
                    saw_not_mounted = true;
                    last_stderr = Some(stderr);
                    continue;
                }

                // A busy mount stays mounted; say so instead of trying the next tool.
                if stderr_lower.contains("device or resource busy")
                    || stderr_lower.contains("target is busy")
                {
                    return Err(Error::StillMounted(format!(
                        "{} ({cmd}: {})",
                        mnt_path.display(),
                        stderr.trim()
                    ))
                    .into());
                }

                last_stderr = Some(stderr);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(Error::Io(err).into()),
        }
    }

    if saw_not_mounted {
        return Err(Error::NotMounted(mnt_path.display().to_string()).into());
    }

    if let Some(stderr) = last_stderr {
        return Err(Error::Cli(format!(
            "failed to unmount {}: {}",
            mnt_path.display(),
            stderr.trim()
        ))
        .into());
    }

    Err(Error::MissingTool("fusermount or umount".into()).into())
}

use thiserror::Error;

pub mod cli;
pub mod compat;
pub mod deps;
pub mod fs;
pub mod logging;
pub mod runner;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid mount path: {0}")]
    InvalidMountPath(String),
    #[error("invalid backing root: {0}")]
    InvalidBackingRoot(String),
    #[error("failed to mount {path}: {reason}")]
    MountFailed { path: String, reason: String },
    #[error("mount point still in use: {0}")]
    StillMounted(String),
    #[error("target is not mounted: {0}")]
    NotMounted(String),
    #[error("required tool not found: {0}")]
    MissingTool(String),
    #[error("command could not be started: {0}")]
    WorkloadNotStarted(String),
    #[error("command `{command}` exited with {status}")]
    WorkloadFailed { command: String, status: String },
    #[error("failed to parse ELF file {path}: {reason}")]
    ElfParse { path: String, reason: String },
    #[error("serialization error")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cli error: {0}")]
    Cli(String),
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    logging::init_logging(logging::LogFormat::Human)?;

    let cli_args = cli::parse_args(args.into_iter().map(Into::into))?;
    cli::dispatch(cli_args)
}

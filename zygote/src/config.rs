//! Command-line configuration for the loader binary.

use std::os::fd::RawFd;
use std::path::PathBuf;

use clap::Parser;

use crate::bridge::codec::DEFAULT_MAX_LINE_LENGTH;

/// Preload application code once, then fork workers on demand.
#[derive(Parser, Debug)]
#[command(name = "zygote")]
#[command(version, about, long_about = None)]
#[command(override_usage = "zygote [OPTIONS] (-r FILE ...) -e EXPR")]
pub struct Cli {
    /// Preload this file. Can be given more than once.
    #[arg(short = 'r', long = "require", value_name = "FILE", required = true)]
    pub require: Vec<PathBuf>,

    /// Run this expression in every worker.
    #[arg(short = 'e', long = "eval", value_name = "EXPR")]
    pub eval: String,

    /// Inherited descriptor for talking to the supervisor.
    #[arg(long, value_name = "FD", default_value_t = 3)]
    pub status_fd: RawFd,

    /// Name of the supervision group, exported to workers.
    #[arg(long, default_value = "zygote")]
    pub name: String,

    /// Version of the loaded code, exported to workers.
    #[arg(long, default_value = "unknown")]
    pub code_version: String,

    /// Directory workers start in.
    #[arg(long, value_name = "DIR", default_value = "/")]
    pub worker_dir: PathBuf,

    /// Also forward loader logs to the supervisor as `log` replies.
    #[arg(long)]
    pub log_to_status: bool,

    /// Lowest level forwarded with --log-to-status.
    #[arg(long, value_name = "LEVEL", default_value_t = tracing::Level::INFO)]
    pub status_log_level: tracing::Level,

    /// Longest accepted command line, in bytes.
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    pub max_line_length: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{} not found", .0.display())]
    MissingPreload(PathBuf),

    #[error("--max-line-length must be greater than zero")]
    ZeroLineLength,
}

/// Validated loader settings.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub preload: Vec<PathBuf>,
    pub entrypoint: String,
    pub status_fd: RawFd,
    pub group: String,
    pub code_version: String,
    pub worker_dir: PathBuf,
    pub status_log_level: Option<tracing::Level>,
    pub max_line_length: usize,
}

impl Cli {
    pub fn into_config(self) -> Result<LoaderConfig, ConfigError> {
        if let Some(missing) = self.require.iter().find(|file| !file.exists()) {
            return Err(ConfigError::MissingPreload(missing.clone()));
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::ZeroLineLength);
        }

        Ok(LoaderConfig {
            preload: self.require,
            entrypoint: self.eval,
            status_fd: self.status_fd,
            group: self.name,
            code_version: self.code_version,
            worker_dir: self.worker_dir,
            status_log_level: self.log_to_status.then_some(self.status_log_level),
            max_line_length: self.max_line_length,
        })
    }
}

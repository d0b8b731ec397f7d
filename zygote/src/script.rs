//! The payload the `zygote` binary runs.
//!
//! Preload files are read into memory and stay resident for the loader's
//! lifetime, shared copy-on-write with every worker. The worker entry point
//! is a `;`-separated list of steps:
//!
//! | step             | effect                                              |
//! |------------------|-----------------------------------------------------|
//! | `ack`            | acknowledge startup to the supervisor               |
//! | `sleep <secs>`   | sleep, fractional seconds allowed                   |
//! | `echo <text>`    | print a line to stdout; `{id}` becomes the worker ID |
//! | `env-dump <path>`| atomically write the set worker environment slots   |
//! | `exit <code>`    | exit immediately with the given status              |
//! | `abort`          | abort the process                                   |

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::env::EnvSlot;
use crate::payload::{Payload, PayloadError, WorkerContext};
use crate::worker_ack;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("unknown step {0:?}")]
    UnknownStep(String),

    #[error("step {0:?} needs an argument")]
    MissingArgument(&'static str),

    #[error("invalid argument {arg:?} for step {step:?}")]
    InvalidArgument { step: &'static str, arg: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Ack,
    Sleep(Duration),
    Echo(String),
    EnvDump(PathBuf),
    Exit(i32),
    Abort,
}

impl FromStr for Step {
    type Err = ScriptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, arg) = match s.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, Some(arg.trim())),
            None => (s, None),
        };
        let arg = arg.filter(|arg| !arg.is_empty());

        match name {
            "ack" => Ok(Step::Ack),
            "abort" => Ok(Step::Abort),
            "sleep" => {
                let arg = arg.ok_or(ScriptError::MissingArgument("sleep"))?;
                arg.parse::<f64>()
                    .ok()
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                    .map(Step::Sleep)
                    .ok_or_else(|| ScriptError::InvalidArgument {
                        step: "sleep",
                        arg: arg.to_string(),
                    })
            }
            "exit" => {
                let arg = arg.ok_or(ScriptError::MissingArgument("exit"))?;
                arg.parse()
                    .map(Step::Exit)
                    .map_err(|_| ScriptError::InvalidArgument {
                        step: "exit",
                        arg: arg.to_string(),
                    })
            }
            "echo" => Ok(Step::Echo(arg.unwrap_or_default().to_string())),
            "env-dump" => {
                let arg = arg.ok_or(ScriptError::MissingArgument("env-dump"))?;
                Ok(Step::EnvDump(PathBuf::from(arg)))
            }
            other => Err(ScriptError::UnknownStep(other.to_string())),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Ack => f.write_str("ack"),
            Step::Sleep(d) => write!(f, "sleep {}", d.as_secs_f64()),
            Step::Echo(text) => write!(f, "echo {text}"),
            Step::EnvDump(path) => write!(f, "env-dump {}", path.display()),
            Step::Exit(code) => write!(f, "exit {code}"),
            Step::Abort => f.write_str("abort"),
        }
    }
}

/// A preloaded script payload.
#[derive(Debug, Default)]
pub struct ScriptPayload {
    steps: Vec<Step>,
    preloaded: Vec<(PathBuf, Vec<u8>)>,
}

impl ScriptPayload {
    /// Parse the worker entry point. Empty segments are ignored.
    pub fn parse(expr: &str) -> Result<Self, ScriptError> {
        let steps = expr
            .split(';')
            .map(str::trim)
            .filter(|step| !step.is_empty())
            .map(str::parse::<Step>)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            steps,
            preloaded: Vec::new(),
        })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    #[cfg(test)]
    fn preloaded_bytes(&self) -> usize {
        self.preloaded.iter().map(|(_, data)| data.len()).sum()
    }

    fn run_step(step: &Step, ctx: &WorkerContext) -> Result<(), PayloadError> {
        match step {
            Step::Ack => {
                // Safety: workers of this payload are single-threaded.
                if !unsafe { worker_ack::done() } {
                    tracing::warn!(worker_id = %ctx.id(), "Not started by a loader; ack skipped");
                }
            }
            Step::Sleep(duration) => std::thread::sleep(*duration),
            Step::Echo(text) => {
                let line = text.replace("{id}", ctx.id().as_str());
                let mut stdout = std::io::stdout().lock();
                writeln!(stdout, "{line}")?;
                stdout.flush()?;
            }
            Step::EnvDump(path) => {
                let dump: String = EnvSlot::ALL
                    .iter()
                    .filter_map(|slot| Some(format!("{}={}\n", slot.key(), slot.get()?)))
                    .collect();
                let partial = path.with_extension("partial");
                fs::write(&partial, dump)?;
                fs::rename(&partial, path)?;
            }
            Step::Exit(code) => std::process::exit(*code),
            Step::Abort => std::process::abort(),
        }
        Ok(())
    }
}

impl Payload for ScriptPayload {
    fn load(&mut self, file: &Path) -> Result<(), PayloadError> {
        let data = fs::read(file)?;
        tracing::debug!(file = %file.display(), bytes = data.len(), "Preloaded file");
        self.preloaded.push((file.to_path_buf(), data));
        Ok(())
    }

    fn run(&self, ctx: WorkerContext) -> Result<(), PayloadError> {
        for step in &self.steps {
            tracing::trace!(worker_id = %ctx.id(), %step, "Running step");
            Self::run_step(step, &ctx)?;
        }
        Ok(())
    }
}

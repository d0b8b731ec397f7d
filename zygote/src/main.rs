use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;

use zygote::bridge::channel::StatusChannel;
use zygote::{Cli, ForkEngine, Loader, Reply, ScriptPayload, ZYGOTE_VERSION, logging};

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.into_config()?;

    let channel = StatusChannel::from_raw_fd(config.status_fd, config.max_line_length)
        .context("opening the status channel")?;
    logging::init_tracing(
        config
            .status_log_level
            .map(|level| (channel.writer(), level)),
    );
    tracing::info!(
        version = ZYGOTE_VERSION,
        group = %config.group,
        code_version = %config.code_version,
        status_fd = config.status_fd,
        "Starting loader"
    );

    let payload = match ScriptPayload::parse(&config.entrypoint) {
        Ok(payload) => payload,
        Err(e) => {
            channel.send(&Reply::Error {
                message: "parsing entry point".to_string(),
                cause: Some(e.to_string()),
            })?;
            return Err(e).context("parsing entry point");
        }
    };

    let engine = ForkEngine::new(&config.group, &config.code_version, config.status_fd)
        .with_worker_dir(&config.worker_dir);
    let mut loader = Loader::new(payload, engine, channel);
    for file in &config.preload {
        loader.load_entrypoint(file)?;
    }
    loader.repl().context("serving the status channel")
}

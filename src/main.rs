use anyhow::Context;
use clap::Parser;
use pinning_bypass_lab::cli::Cli;
use std::process::ExitCode;

const SIGHUP: u8 = 1;
const SIGINT: u8 = 2;
const SIGTERM: u8 = 15;

#[cfg(unix)]
async fn termination_signal() -> u8 {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut hangup), Ok(mut interrupt), Ok(mut terminate)) = (
        signal(SignalKind::hangup()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        tracing::warn!("signal handlers unavailable; falling back to ctrl-c");
        let _ = tokio::signal::ctrl_c().await;
        return SIGINT;
    };

    tokio::select! {
        _ = hangup.recv() => SIGHUP,
        _ = interrupt.recv() => SIGINT,
        _ = terminate.recv() => SIGTERM,
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> u8 {
    let _ = tokio::signal::ctrl_c().await;
    SIGINT
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    pinning_bypass_lab::init_tracing(&cli.log_dir)
        .with_context(|| format!("cannot set up logging in {}", cli.log_dir.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("cannot start the async runtime")?;

    // Dropping the command future on a signal closes the store and kills tracked children.
    let code = runtime.block_on(async {
        tokio::select! {
            // Polled first so the handlers are installed before the command starts work.
            biased;
            signal = termination_signal() => {
                tracing::warn!(signal, "terminated by signal");
                ExitCode::from(128 + signal)
            }
            result = pinning_bypass_lab::execute(cli) => match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(error) => {
                    tracing::error!(error = %error, "command failed");
                    eprintln!("error: {}", error);
                    ExitCode::FAILURE
                }
            },
        }
    });
    runtime.shutdown_background();
    Ok(code)
}

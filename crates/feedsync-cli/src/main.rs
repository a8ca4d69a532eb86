mod output;

use anyhow::Context;
use clap::Parser;
use feedsync_core::{Cancellation, Config, RunOptions, Snapshot, Workflow};
use output::ConsoleProgress;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "feedsync",
    about = "Wait for the engine's feed sync to finish, then export a preloaded database snapshot",
    version
)]
struct Cli {
    /// Sync timeout in minutes (clamped to 5–900, defaults to 30 if unparseable)
    timeout: String,

    /// Sync check interval in seconds (clamped to 1–60, defaults to 5 if unparseable)
    interval: String,

    /// Do not include the nvdv2/cpev2 vulnerability data in the snapshot
    #[arg(long)]
    slim: bool,

    /// YAML file overriding engine, service, readiness and snapshot defaults
    #[arg(long, env = "FEEDSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Engine API base URL
    #[arg(long, env = "FEEDSYNC_URL")]
    url: Option<String>,

    /// Engine API user
    #[arg(long, env = "FEEDSYNC_USER")]
    user: Option<String>,

    /// Engine API password
    #[arg(long, env = "FEEDSYNC_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Log stage transitions (RUST_LOG takes precedence)
    #[arg(long, short)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = match run_until_interrupted(&cli) {
        Ok(Some(snapshot)) => {
            output::print_success(&snapshot);
            0
        }
        Ok(None) => {
            println!("\n\nReceived interrupt signal. Exiting...");
            130
        }
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

/// Run the workflow on a worker thread while this thread waits for either
/// its result or Ctrl+C. `Ok(None)` means the user interrupted; every child
/// the workflow started has been killed and reaped by then.
fn run_until_interrupted(cli: &Cli) -> anyhow::Result<Option<Snapshot>> {
    let (config, options) = load_settings(cli)?;
    output::print_banner(&options);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start signal runtime")?;

    rt.block_on(async move {
        let cancel = Cancellation::new();
        let worker_cancel = cancel.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let result = Workflow::new(config, options, ConsoleProgress::default())
                .map(|workflow| workflow.with_cancellation(worker_cancel))
                .and_then(|mut workflow| workflow.run());
            let _ = tx.send(result);
        });

        // A terminal Ctrl+C also kills the children, so the workflow may
        // finish with an error in the same instant; the interrupt wins.
        tokio::select! {
            biased;
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl+C")?;
                tracing::info!(children = cancel.live_children(), "interrupted");
                tokio::task::spawn_blocking(move || cancel.cancel())
                    .await
                    .context("failed to stop child processes")?;
                Ok(None)
            }
            result = rx => {
                let result = result.context("workflow thread exited without a result")?;
                Ok(Some(result?))
            }
        }
    })
}

fn load_settings(cli: &Cli) -> anyhow::Result<(Config, RunOptions)> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(url) = &cli.url {
        config.engine.url = url.clone();
    }
    if let Some(user) = &cli.user {
        config.engine.user = user.clone();
    }
    if let Some(password) = &cli.password {
        config.engine.password = password.clone();
    }
    config.validate()?;

    let options = RunOptions::from_args(&cli.timeout, &cli.interval, cli.slim);
    tracing::info!(
        timeout_minutes = options.timeout_minutes(),
        interval_secs = options.interval.as_secs_f64(),
        slim = options.slim,
        "settings"
    );
    Ok((config, options))
}

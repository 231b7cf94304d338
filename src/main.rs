//! bitleech - command-line entry point

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use bitleech::{CliArgs, CompletionCallback, Config, ProgressDisplay, TorrentSession};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Log panics through tracing before the default hook runs
fn setup_panic_handler() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        if let Some(location) = panic_info.location() {
            error!("PANIC at {}:{}:{}", location.file(), location.line(), location.column());
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        }
        default_hook(panic_info);
    }));
}

fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.verbose {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args);
    config.validate().context("Invalid configuration")?;

    let mut progress = ProgressDisplay::new(config.quiet);
    let (done_tx, done_rx) = oneshot::channel();
    let on_complete: CompletionCallback = Box::new(move |name| {
        let _ = done_tx.send(name);
    });

    let (session, task) = TorrentSession::start(
        &config.torrent_file,
        &config.output_dir,
        config.session_config(),
        Some(on_complete),
    )
    .await
    .with_context(|| format!("Failed to start {}", config.torrent_file.display()))?;
    progress.print_status(&format!("Downloading {} to {}", session.name(), config.output_dir.display()))?;

    let outcome = run(&session, &mut progress, done_rx, tokio::signal::ctrl_c()).await;
    if let Err(e) = session.shutdown().await {
        debug!("Session already stopped: {}", e);
    }
    if let Err(e) = task.await {
        error!("Session task failed: {}", e);
    }
    if let Err(e) = &outcome {
        progress.print_error(&e.to_string());
    }
    outcome
}

/// Render progress until the download completes or `interrupt` fires
async fn run(
    session: &TorrentSession,
    progress: &mut ProgressDisplay,
    mut done: oneshot::Receiver<String>,
    interrupt: impl Future<Output = std::io::Result<()>>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            name = &mut done => {
                if name.is_ok() {
                    let status = session.status().await?;
                    progress.print_complete(&status)?;
                    info!("Finished {}", status.name);
                }
                return Ok(());
            }
            _ = &mut interrupt => {
                progress.print_status("Interrupted, saving progress...")?;
                info!("Ctrl-C received, shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                let status = session.status().await?;
                progress.update(&status)?;
            }
        }
    }
}

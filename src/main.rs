use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use modelvault::config::Config;
use modelvault::ipc::{client::IpcClient, server::IpcServer, Command, Response};
use modelvault::models::{format_bytes, DownloadState, ModelEvent, ModelManager, Phase};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "modelvault")]
#[command(about = "Verified model artifact downloads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Daemon,
    /// Ask the daemon to download a model
    Download { id: String },
    /// Cancel a running download
    Cancel { id: String },
    /// Delete a downloaded or failed model
    Delete { id: String },
    /// Show one model, or every model when no id is given
    Status { id: Option<String> },
    /// Download a model in this process with a progress bar
    Pull { id: String },
    /// Re-hash an installed model against the manifest
    Verify { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modelvault=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Daemon) => run_daemon().await,
        Some(Commands::Download { id }) => run_client(Command::Download(id)).await,
        Some(Commands::Cancel { id }) => run_client(Command::Cancel(id)).await,
        Some(Commands::Delete { id }) => run_client(Command::Delete(id)).await,
        Some(Commands::Status { id: Some(id) }) => run_client(Command::Status(id)).await,
        Some(Commands::Status { id: None }) => run_client(Command::List).await,
        Some(Commands::Pull { id }) => run_pull(&id).await,
        Some(Commands::Verify { id }) => run_verify(&id).await,
    }
}

fn load_manager() -> anyhow::Result<ModelManager> {
    let config = Config::load().context("Failed to load configuration")?;
    ModelManager::new(&config).context("Failed to initialize model manager")
}

async fn run_daemon() -> anyhow::Result<()> {
    tracing::info!("Starting modelvault daemon");
    let manager = load_manager()?;

    // Mirror lifecycle events into the log
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ModelEvent::Progress { .. }) => {}
                Ok(event) => tracing::debug!("Event: {event:?}"),
                Err(RecvError::Lagged(n)) => tracing::debug!("Event log skipped {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let server = IpcServer::new(manager)?;

    tokio::select! {
        result = server.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    Ok(())
}

async fn run_client(cmd: Command) -> anyhow::Result<()> {
    let client = IpcClient::new()?;
    let response = client.send_command(&cmd).await?;

    match response {
        Response::Ok => {
            println!("OK");
        }
        Response::Started(outcome) => {
            println!("{outcome:?}");
        }
        Response::Status(state) => print_state(&state),
        Response::Models(states) => {
            for state in &states {
                print_state(state);
            }
        }
        Response::Error(report) => {
            eprintln!("Error ({:?}): {}", report.code, report.describe());
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_state(state: &DownloadState) {
    let mut line = format!("{:<24} {}", state.id, state.phase);
    if state.phase == Phase::Downloading || state.bytes_downloaded > 0 {
        line.push_str(&format!(
            " ({} / {})",
            format_bytes(state.bytes_downloaded),
            format_bytes(state.bytes_total)
        ));
    }
    if let Some(error) = &state.last_error {
        line.push_str(&format!(" - {}", error.message));
    }
    println!("{line}");
}

async fn run_pull(id: &str) -> anyhow::Result<()> {
    let manager = load_manager()?;
    let entry = manager.entry(id)?;

    let pb = ProgressBar::new(entry.size_bytes);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(format!("Downloading {}", entry.name));

    let mut events = manager.subscribe();
    let watcher = {
        let pb = pb.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.id() != id => {}
                    Ok(ModelEvent::Progress {
                        bytes_downloaded,
                        bytes_total,
                        ..
                    }) => {
                        pb.set_length(bytes_total);
                        pb.set_position(bytes_downloaded);
                    }
                    Ok(ModelEvent::PhaseChanged { phase, .. }) => pb.set_message(phase.to_string()),
                    Ok(_) | Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(_)) => {}
                }
            }
        })
    };

    let result = tokio::select! {
        result = manager.download(id) => result,
        _ = tokio::signal::ctrl_c() => {
            manager.cancel_download(id).ok();
            manager.wait(id).await?;
            pb.abandon_with_message("Cancelled");
            bail!("Download of '{id}' cancelled");
        }
    };
    watcher.abort();

    match result {
        Ok(path) => {
            pb.finish_with_message("Ready");
            println!("✓ {} ready at {}", entry.name, path.display());
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message("Failed");
            Err(anyhow::Error::new(e).context(format!("Failed to download '{id}'")))
        }
    }
}

async fn run_verify(id: &str) -> anyhow::Result<()> {
    let manager = load_manager()?;
    manager.verify_installed(id).await?;
    println!("✓ {id} matches the manifest");
    Ok(())
}

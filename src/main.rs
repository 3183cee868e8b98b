//! `molsync` monitor: subscribe to a trajectory server and log frame
//! updates.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use molsync::connection::Connection;
use molsync::options::Options;
use molsync::session::{CommandClient, FrameUpdate, TrajectorySession};

#[derive(Parser)]
#[command(name = "molsync", about = "Watch a molecular simulation server")]
struct Cli {
    /// TOML options preset.
    #[arg(long)]
    options: Option<PathBuf>,
    /// Server host (overrides the preset).
    #[arg(long)]
    host: Option<String>,
    /// Server port (overrides the preset).
    #[arg(long)]
    port: Option<u16>,
    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    duration: Option<u64>,
    /// Send the play command once subscribed.
    #[arg(long)]
    play: bool,
    /// Print the server's commands and exit.
    #[arg(long)]
    list_commands: bool,
    /// Write the default options to this path and exit.
    #[arg(long)]
    write_default_options: Option<PathBuf>,
}

fn describe(update: &FrameUpdate) -> String {
    let changed: Vec<String> = update
        .changes
        .fields()
        .map(|field| field.key().to_owned())
        .chain(update.changes.extra_keys().map(str::to_owned))
        .collect();
    format!(
        "frame {} (v{}): {} particles, changed [{}]",
        update
            .frame_index
            .map_or_else(|| "-".to_owned(), |index| index.to_string()),
        update.version,
        update.frame.particle_count(),
        changed.join(", ")
    )
}

async fn wait(duration: Option<u64>) -> Result<()> {
    match duration {
        Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
        None => tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();
    let cli = Cli::parse();

    if let Some(path) = &cli.write_default_options {
        Options::default()
            .save(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        log::info!("default options written to {}", path.display());
        return Ok(());
    }

    let mut options = match &cli.options {
        Some(path) => Options::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Options::default(),
    };
    if let Some(host) = cli.host {
        options.connection.host = host;
    }
    if let Some(port) = cli.port {
        options.connection.port = port;
    }

    let connection = Arc::new(
        Connection::connect(&options.connection)
            .context("failed to create connection")?,
    );

    if cli.list_commands {
        let commands =
            CommandClient::new(Arc::clone(&connection), options.commands.clone());
        for name in commands.available_commands().await? {
            log::info!("{name}");
        }
        connection.close().await;
        return Ok(());
    }

    let session = TrajectorySession::new(options.trajectory, options.commands);
    session.on_frame_changed(|update| log::info!("{}", describe(update)));
    session.open_client(Arc::clone(&connection)).await?;
    if cli.play {
        session.play();
    }

    wait(cli.duration).await?;

    session.close_client().await;
    connection.close().await;
    log::info!("{} frames received", session.frame_version());
    Ok(())
}

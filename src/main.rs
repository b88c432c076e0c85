use std::{env, fs, process::ExitCode};

use tracing::error;
use tracing_subscriber::EnvFilter;

use peerfetch::{download, generate_peer_id, Torrent, Tracker};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Some(path) = env::args().nth(1) else {
        eprintln!("usage: peerfetch <file.torrent>");
        return ExitCode::FAILURE;
    };

    match run(&path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "download failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(path: &str) -> Result<(), peerfetch::Error> {
    let torrent = Torrent::from_file(path)?;
    torrent.describe();

    let peer_id = generate_peer_id();
    let peers = Tracker.announce(&torrent, &peer_id).await?;

    let output = download(&torrent, peers, peer_id).await?;
    fs::write(&torrent.info.name, output)?;
    println!("saved {}", torrent.info.name);
    Ok(())
}

//! Torrent download demo
//!
//! Loads a .torrent file and downloads it into the current directory (or a
//! given output directory), printing progress until the content verifies.
//!
//! Usage: cargo run --example torrent_download -- path/to/file.torrent [output-dir]

use std::env;
use std::process::ExitCode;
use std::time::Duration;

use swarm_dl::{ClientConfig, Metainfo, SwarmDownloader};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let mut args = env::args().skip(1);
    let Some(torrent_path) = args.next() else {
        eprintln!("Usage: torrent_download <path-to-torrent-file> [output-dir]");
        return ExitCode::FAILURE;
    };
    let output_dir = args.next().unwrap_or_else(|| ".".to_string());

    let data = match std::fs::read(&torrent_path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("failed to read {}: {}", torrent_path, e);
            return ExitCode::FAILURE;
        }
    };

    let metainfo = match Metainfo::parse(&data) {
        Ok(metainfo) => metainfo,
        Err(e) => {
            eprintln!("failed to parse {}: {}", torrent_path, e);
            return ExitCode::FAILURE;
        }
    };
    println!("{}", metainfo);

    let config = ClientConfig {
        output_dir: output_dir.into(),
        ..ClientConfig::default()
    };
    let swarm = match SwarmDownloader::new(metainfo, config) {
        Ok(swarm) => swarm,
        Err(e) => {
            eprintln!("failed to set up download: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Ctrl-C triggers a clean shutdown with the final tracker announce.
    let token = swarm.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nshutting down...");
            token.cancel();
        }
    });

    // Progress line every few seconds while the swarm runs.
    let reporter = {
        let swarm = swarm.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(5));
            loop {
                tick.tick().await;
                let status = swarm.status();
                println!(
                    "{}/{} pieces ({:.1}%) | {} peers | {} seeders / {} leechers",
                    status.progress.completed_pieces,
                    status.progress.total_pieces,
                    status.progress.percentage,
                    status.connected_peers,
                    status.seeders,
                    status.leechers,
                );
            }
        })
    };

    let result = swarm.run().await;
    reporter.abort();

    match result {
        Ok(true) => {
            println!("download complete");
            ExitCode::SUCCESS
        }
        Ok(false) => {
            println!("download stopped before completion");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("download failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

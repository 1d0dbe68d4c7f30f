mod manifest;
mod mirror;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use haven_swarm::{FileSet, Swarm, SwarmConfig, SwarmCoordinator, SwarmOutcome, TracingLogger};
use tracing::{error, info};

use crate::manifest::Manifest;
use crate::mirror::MirrorSource;

/// Interval between progress lines.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "haven_swarm=info,haven_swarm_cli=info".into()),
        )
        .init();

    let mut args = std::env::args_os().skip(1);
    let (Some(manifest_path), Some(output_dir)) = (args.next(), args.next()) else {
        eprintln!("usage: haven-swarm <manifest.json> <output-dir>");
        std::process::exit(2);
    };
    let manifest_path = PathBuf::from(manifest_path);
    let output_dir = PathBuf::from(output_dir);

    // Config
    let config = SwarmConfig::from_env();
    let manifest = Manifest::load(&manifest_path)?;
    let verifier = manifest.verifier()?;
    info!(
        "Downloading {} bytes in {} file(s) from {} source(s) into {}",
        manifest.total_length(),
        manifest.files.len(),
        manifest.sources.len(),
        output_dir.display()
    );
    info!(
        "Max chunk {} bytes, selection {:?}, queue retry {} ms",
        config.max_chunk_size, config.selection, config.queue_retry_ms
    );

    let files = FileSet::create(&output_dir, manifest.file_map()?)?;
    let mut swarm = Swarm::new(files, verifier, config, Arc::new(TracingLogger))?;
    for source in &manifest.sources {
        let id = swarm.add_source(MirrorSource::new(source))?;
        info!("Source {} attached: {}", id, source.label());
    }

    let reporter = tokio::spawn(report_progress(swarm.coordinator()));

    let finished = tokio::select! {
        outcome = swarm.wait() => Some(outcome),
        _ = tokio::signal::ctrl_c() => None,
    };
    let outcome = match finished {
        Some(outcome) => outcome,
        None => {
            info!("Received Ctrl+C, cancelling...");
            swarm.cancel().await
        }
    };
    reporter.abort();

    let progress = swarm.coordinator().progress();
    match outcome {
        SwarmOutcome::Complete { bytes } => {
            info!(
                "Download complete: {} bytes verified, {} bytes re-fetched after failed verification",
                bytes,
                progress.lost()
            );
            Ok(())
        }
        SwarmOutcome::Failed(reason) => {
            error!(
                "Download failed: {} ({:.1}% verified)",
                reason,
                progress.fraction() * 100.0
            );
            std::process::exit(1);
        }
    }
}

async fn report_progress(coordinator: Arc<SwarmCoordinator>) {
    let progress = coordinator.progress();
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if coordinator.outcome().is_some() {
            break;
        }
        info!(
            "{:.1}% verified, {} sources live, {} bytes lost",
            progress.fraction() * 100.0,
            coordinator
                .connections()
                .iter()
                .filter(|c| c.state().is_live())
                .count(),
            progress.lost()
        );
    }
}

//! Duocast consolidation worker
//!
//! Turns each finished session's per-participant fragments into durable,
//! playable recordings: one continuous track per participant plus the
//! side-by-side composition end users see.

mod config;
mod database;
mod pipeline;
mod storage;
mod transcode;

use config::Config;
use database::SessionStore;
use pipeline::{Pipeline, PipelineRunner, PipelineSettings};
use std::sync::Arc;
use storage::StorageClient;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcode::FfmpegTranscoder;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,duocast=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let session_ids: Vec<String> = std::env::args().skip(1).collect();
    if session_ids.is_empty() {
        eprintln!("Usage: duocast <session-id> [<session-id>...]");
        std::process::exit(2);
    }

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("Please ensure MEDIA_CLOUD, MEDIA_API_KEY and MEDIA_API_SECRET are set");
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&config.scratch_dir) {
        error!("Failed to create scratch directory: {}", e);
        std::process::exit(1);
    }

    let media = match StorageClient::new(&config) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to build storage client: {}", e);
            std::process::exit(1);
        }
    };

    let sessions = match SessionStore::open(&config.sessions_db_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open session store: {}", e);
            std::process::exit(1);
        }
    };

    let pipeline = Arc::new(Pipeline::new(
        media,
        Arc::new(FfmpegTranscoder),
        sessions,
        PipelineSettings::from(&config),
    ));
    let runner = Arc::new(PipelineRunner::new(pipeline));

    info!("Consolidating {} session(s)", session_ids.len());

    let mut handles = Vec::new();
    for session_id in session_ids {
        let runner = runner.clone();
        handles.push(tokio::spawn(async move {
            let outcome = runner.run(&session_id).await;
            (session_id, outcome)
        }));
    }

    let mut failed = false;
    for handle in handles {
        match handle.await {
            Ok((_, Ok(recordings))) => {
                info!(
                    "[{}] Final recording: {}",
                    recordings.session_id, recordings.merged_url
                );
                if !recordings.reap_failures.is_empty() {
                    warn!(
                        "[{}] Reaping left {} failure(s): {}",
                        recordings.session_id,
                        recordings.reap_failures.len(),
                        recordings.reap_failures.join("; ")
                    );
                }
            }
            Ok((session_id, Err(e))) => {
                error!("[{}] Consolidation failed: {}", session_id, e);
                failed = true;
            }
            Err(e) => {
                error!("Worker task panicked: {}", e);
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
}

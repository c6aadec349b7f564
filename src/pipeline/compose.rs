//! Side-by-side composition
//!
//! Downloads both finished per-participant recordings and drives the
//! local transcoding engine to produce the single recording end users
//! see.

use crate::config::PollPolicy;
use crate::pipeline::fragments::{merged_public_id, track_public_id, Role};
use crate::pipeline::visibility::await_visibility;
use crate::pipeline::PipelineError;
use crate::storage::{MediaStore, ResourceKind};
use crate::transcode::Transcoder;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Session-qualified scratch path; concurrent sessions never collide
fn scratch_path(scratch_dir: &Path, session_id: &str, part: &str) -> PathBuf {
    scratch_dir.join(format!("{}-{}.mp4", session_id, part))
}

/// Remove scratch files, logging rather than failing
async fn remove_scratch(paths: &[PathBuf]) {
    for path in paths {
        match fs::remove_file(path).await {
            Ok(()) => debug!("Removed scratch file {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove scratch file {:?}: {}", path, e),
        }
    }
}

/// Compose both participant recordings into the canonical merged asset
///
/// Scratch files are deleted on success and on every failure path.
pub async fn compose_session<S, T>(
    media: &S,
    transcoder: &T,
    session_id: &str,
    scratch_dir: &Path,
    poll: &PollPolicy,
) -> Result<String, PipelineError>
where
    S: MediaStore + ?Sized,
    T: Transcoder + ?Sized,
{
    let host_path = scratch_path(scratch_dir, session_id, "host");
    let guest_path = scratch_path(scratch_dir, session_id, "guest");
    let merged_path = scratch_path(scratch_dir, session_id, "merged");
    let scratch = [host_path.clone(), guest_path.clone(), merged_path.clone()];

    let result = run(
        media,
        transcoder,
        session_id,
        &host_path,
        &guest_path,
        &merged_path,
        poll,
    )
    .await;

    remove_scratch(&scratch).await;
    result
}

async fn run<S, T>(
    media: &S,
    transcoder: &T,
    session_id: &str,
    host_path: &Path,
    guest_path: &Path,
    merged_path: &Path,
    poll: &PollPolicy,
) -> Result<String, PipelineError>
where
    S: MediaStore + ?Sized,
    T: Transcoder + ?Sized,
{
    // Both tracks must be fully settled before compositing starts
    for role in [Role::Host, Role::Guest] {
        let track_id = track_public_id(session_id, role);
        let status = await_visibility(media, ResourceKind::Video, &track_id, poll).await?;
        if !status.exists {
            return Err(PipelineError::MissingRecording(role));
        }
        if let Some(duration) = status.duration {
            debug!("[{}] {} track runs {:.1}s", session_id, role, duration);
        }
    }

    info!("[{}] Downloading participant recordings", session_id);
    let host_url = media.delivery_url(&track_public_id(session_id, Role::Host));
    let guest_url = media.delivery_url(&track_public_id(session_id, Role::Guest));
    media.download(&host_url, host_path).await?;
    media.download(&guest_url, guest_path).await?;

    transcoder
        .compose_side_by_side(host_path, guest_path, merged_path)
        .await?;

    let target_id = merged_public_id(session_id);
    let asset = media.upload_file(merged_path, &target_id).await?;
    info!(
        "[{}] Composed recording stored at {}",
        session_id, asset.secure_url
    );
    Ok(asset.secure_url)
}

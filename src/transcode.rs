//! Local transcoding engine
//!
//! Wraps ffmpeg for side-by-side composition of two finished participant
//! recordings.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffmpeg failed: {0}")]
    Engine(String),
}

/// Width of each participant tile in the composed frame
pub const TILE_WIDTH: u32 = 640;
/// Height of each participant tile in the composed frame
pub const TILE_HEIGHT: u32 = 720;

/// Local engine that composes two recordings into one
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Compose `host` (left, audio source) and `guest` (right) into `output`
    async fn compose_side_by_side(
        &self,
        host: &Path,
        guest: &Path,
        output: &Path,
    ) -> Result<(), TranscodeError>;
}

/// Filter graph: scale + center-crop each input to a fixed tile, then
/// stack host left and guest right.
fn side_by_side_filter() -> String {
    let tile = format!(
        "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h},setsar=1",
        w = TILE_WIDTH,
        h = TILE_HEIGHT
    );
    format!("[0:v]{tile}[left];[1:v]{tile}[right];[left][right]hstack=inputs=2[v]")
}

/// Full argument list for one composition run
fn compose_args(host: &Path, guest: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        host.to_string_lossy().to_string(),
        "-i".to_string(),
        guest.to_string_lossy().to_string(),
        "-filter_complex".to_string(),
        side_by_side_filter(),
        "-map".to_string(),
        "[v]".to_string(),
        // Audio comes from the host input only
        "-map".to_string(),
        "0:a".to_string(),
        "-c:v".to_string(),
        "libx264".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-crf".to_string(),
        "23".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-movflags".to_string(),
        "+faststart".to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "192k".to_string(),
        // Truncate to the shorter input so the tracks stay in sync
        "-shortest".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

/// ffmpeg-backed transcoder
pub struct FfmpegTranscoder;

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn compose_side_by_side(
        &self,
        host: &Path,
        guest: &Path,
        output: &Path,
    ) -> Result<(), TranscodeError> {
        let args = compose_args(host, guest, output);
        info!("Starting ffmpeg composition: {:?}", output);

        let result = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(TranscodeError::Engine(stderr.trim().to_string()));
        }

        info!("ffmpeg composition finished: {:?}", output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn args_for_test() -> Vec<String> {
        compose_args(
            &PathBuf::from("/tmp/sess1-host.mp4"),
            &PathBuf::from("/tmp/sess1-guest.mp4"),
            &PathBuf::from("/tmp/sess1-merged.mp4"),
        )
    }

    #[test]
    fn filter_crops_each_input_and_stacks_horizontally() {
        let filter = side_by_side_filter();
        assert_eq!(filter.matches("crop=640:720").count(), 2);
        assert!(filter.contains("force_original_aspect_ratio=increase"));
        assert!(filter.contains("hstack=inputs=2"));
        assert!(filter.starts_with("[0:v]"));
        assert!(filter.contains("[1:v]"));
    }

    #[test]
    fn output_is_truncated_to_the_shorter_input() {
        let args = args_for_test();
        assert!(args.contains(&"-shortest".to_string()));
    }

    #[test]
    fn audio_is_mapped_from_the_host_input_only() {
        let args = args_for_test();
        let audio_maps: Vec<String> = args
            .windows(2)
            .filter(|pair| pair[0] == "-map" && pair[1].ends_with(":a"))
            .map(|pair| pair[1].clone())
            .collect();
        assert_eq!(audio_maps, vec!["0:a".to_string()]);
    }

    #[test]
    fn encodes_fixed_codecs_with_fast_start() {
        let args = args_for_test();
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"aac".to_string()));
        assert!(args.contains(&"+faststart".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/sess1-merged.mp4");
    }
}

//! Clip stitching and frame extraction via the `ffmpeg` / `ffprobe` CLIs.

use crate::error::{ReelWatchError, Result};
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

/// Runs an external tool and returns its stdout.
async fn run(program: &str, args: Vec<OsString>) -> Result<String> {
    tracing::debug!(program, ?args, "running media tool");
    let output = Command::new(program)
        .args(&args)
        .output()
        .await
        .map_err(|e| {
            ReelWatchError::Media(format!(
                "failed to run {program}: {e}. Install it from https://ffmpeg.org/download.html"
            ))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        return Err(ReelWatchError::Media(format!(
            "{program} exited with {}: {}",
            output.status,
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Returns the container duration of a media file.
pub async fn probe_duration(path: impl AsRef<Path>) -> Result<Duration> {
    let path = path.as_ref();
    let stdout = run(
        "ffprobe",
        vec![
            "-v".into(),
            "error".into(),
            "-show_entries".into(),
            "format=duration".into(),
            "-of".into(),
            "default=noprint_wrappers=1:nokey=1".into(),
            path.into(),
        ],
    )
    .await?;
    parse_duration(&stdout).ok_or_else(|| {
        ReelWatchError::Media(format!(
            "could not read duration of {}: {stdout:?}",
            path.display()
        ))
    })
}

fn parse_duration(text: &str) -> Option<Duration> {
    let secs: f64 = text.trim().parse().ok()?;
    (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

fn stitch_args(first: &Path, second: &Path, output: &Path) -> Vec<OsString> {
    vec![
        "-y".into(),
        "-v".into(),
        "error".into(),
        "-i".into(),
        first.into(),
        "-i".into(),
        second.into(),
        "-filter_complex".into(),
        "[0:v][1:v]concat=n=2:v=1:a=0[outv]".into(),
        "-map".into(),
        "[outv]".into(),
        output.into(),
    ]
}

fn last_frame_args(video: &Path, output: &Path) -> Vec<OsString> {
    vec![
        "-y".into(),
        "-v".into(),
        "error".into(),
        "-sseof".into(),
        "-1".into(),
        "-i".into(),
        video.into(),
        "-update".into(),
        "1".into(),
        "-q:v".into(),
        "1".into(),
        output.into(),
    ]
}

/// Plays `second` right after `first` and writes the result to `output`.
///
/// The second clip starts at the first clip's duration.
pub async fn stitch_videos(
    first: impl AsRef<Path>,
    second: impl AsRef<Path>,
    output: impl AsRef<Path>,
) -> Result<()> {
    let (first, second, output) = (first.as_ref(), second.as_ref(), output.as_ref());
    let offset = probe_duration(first).await?;
    tracing::debug!(
        first = %first.display(),
        offset_secs = offset.as_secs_f64(),
        "second clip starts where the first ends"
    );

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    run("ffmpeg", stitch_args(first, second, output)).await?;
    tracing::info!(output = %output.display(), "stitched video saved");
    Ok(())
}

/// Saves the last frame of `video` as an image (format from the extension).
pub async fn extract_last_frame(video: impl AsRef<Path>, output: impl AsRef<Path>) -> Result<()> {
    let (video, output) = (video.as_ref(), output.as_ref());
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    run("ffmpeg", last_frame_args(video, output)).await?;
    if !tokio::fs::try_exists(output).await? {
        return Err(ReelWatchError::Media(format!(
            "no frame could be read from {}",
            video.display()
        )));
    }
    tracing::info!(output = %output.display(), "last frame saved");
    Ok(())
}

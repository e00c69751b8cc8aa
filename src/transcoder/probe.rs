//! ffprobe front-end: container/stream metadata for source and output files.

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use crate::catalog::models::VideoMetadata;

use super::TranscodeError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Prober {
    ffprobe_path: String,
}

impl Prober {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Prober {
            ffprobe_path: ffprobe_path.into(),
        }
    }

    /// Probe a local media file. Fails if there is no video stream.
    pub async fn probe(&self, path: &Path) -> Result<VideoMetadata, TranscodeError> {
        let output = tokio::time::timeout(
            PROBE_TIMEOUT,
            Command::new(&self.ffprobe_path)
                .arg("-v")
                .arg("quiet")
                .arg("-print_format")
                .arg("json")
                .arg("-show_format")
                .arg("-show_streams")
                .arg(path)
                .output(),
        )
        .await
        .map_err(|_| TranscodeError::Probe("ffprobe timed out".to_string()))??;

        if !output.status.success() {
            return Err(TranscodeError::Probe(format!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let data: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| TranscodeError::Probe(format!("unparseable ffprobe output: {}", e)))?;
        let metadata = parse_probe_output(&data)?;
        debug!(path = %path.display(), duration = metadata.duration, "probed media");
        Ok(metadata)
    }
}

fn parse_probe_output(data: &Value) -> Result<VideoMetadata, TranscodeError> {
    let streams = data["streams"].as_array();
    let video_stream = streams
        .and_then(|streams| {
            streams
                .iter()
                .find(|s| s["codec_type"].as_str() == Some("video"))
        })
        .ok_or_else(|| TranscodeError::Probe("no video stream found in file".to_string()))?;
    let audio_stream = streams.and_then(|streams| {
        streams
            .iter()
            .find(|s| s["codec_type"].as_str() == Some("audio"))
    });

    let format = &data["format"];
    let duration = format["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    let bitrate = format["bit_rate"]
        .as_str()
        .and_then(|b| b.parse::<i64>().ok())
        .unwrap_or(0);

    Ok(VideoMetadata {
        duration,
        width: video_stream["width"].as_i64().unwrap_or(0),
        height: video_stream["height"].as_i64().unwrap_or(0),
        codec: video_stream["codec_name"]
            .as_str()
            .unwrap_or("unknown")
            .to_string(),
        bitrate,
        fps: parse_frame_rate(video_stream["r_frame_rate"].as_str().unwrap_or("0/1")),
        audio_codec: audio_stream
            .and_then(|s| s["codec_name"].as_str())
            .map(str::to_string),
    })
}

/// ffprobe reports frame rates as fractions ("30000/1001") or plain
/// decimals; division by zero degrades to 0.
fn parse_frame_rate(raw: &str) -> f64 {
    let fps = match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().unwrap_or(0.0);
            let den: f64 = den.parse().unwrap_or(0.0);
            if den == 0.0 {
                0.0
            } else {
                num / den
            }
        }
        None => raw.parse().unwrap_or(0.0),
    };
    (fps * 100.0).round() / 100.0
}

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    ToolFailed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("Could not parse duration {output:?} for {path}")]
    InvalidDuration { path: String, output: String },
}

/// Video decoding, delegated to an external tool. The hashing core only
/// decides which timestamps to sample.
#[async_trait]
pub trait VideoService: Send + Sync {
    /// Duration of the video in seconds.
    async fn get_duration(&self, path: &Path) -> Result<f64, VideoError>;

    /// Decode the frame at `timestamp` seconds and write it as an image to
    /// `output_path`.
    async fn extract_frame(
        &self,
        path: &Path,
        timestamp: f64,
        output_path: &Path,
    ) -> Result<(), VideoError>;
}

/// `VideoService` that shells out to `ffprobe` and `ffmpeg`.
#[derive(Debug, Clone)]
pub struct FfmpegVideoService {
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
}

impl FfmpegVideoService {
    pub fn new(ffmpeg_path: impl Into<PathBuf>, ffprobe_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }

    async fn run(program: &Path, command: &mut Command) -> Result<Vec<u8>, VideoError> {
        let program = program.to_string_lossy().to_string();
        let output = command.output().await.map_err(|source| VideoError::Spawn {
            program: program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(VideoError::ToolFailed {
                program,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(output.stdout)
    }
}

impl Default for FfmpegVideoService {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

#[async_trait]
impl VideoService for FfmpegVideoService {
    async fn get_duration(&self, path: &Path) -> Result<f64, VideoError> {
        let stdout = Self::run(
            &self.ffprobe_path,
            Command::new(&self.ffprobe_path)
                .args(["-v", "error", "-show_entries", "format=duration"])
                .args(["-of", "default=noprint_wrappers=1:nokey=1"])
                .arg(path),
        )
        .await?;

        parse_duration(&String::from_utf8_lossy(&stdout)).ok_or_else(|| {
            VideoError::InvalidDuration {
                path: path.to_string_lossy().to_string(),
                output: String::from_utf8_lossy(&stdout).trim().to_string(),
            }
        })
    }

    async fn extract_frame(
        &self,
        path: &Path,
        timestamp: f64,
        output_path: &Path,
    ) -> Result<(), VideoError> {
        Self::run(
            &self.ffmpeg_path,
            Command::new(&self.ffmpeg_path)
                .args(["-v", "error", "-y", "-ss"])
                .arg(format!("{:.3}", timestamp))
                .arg("-i")
                .arg(path)
                .args(["-frames:v", "1"])
                .arg(output_path),
        )
        .await?;
        Ok(())
    }
}

fn parse_duration(output: &str) -> Option<f64> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("12.345000\n"), Some(12.345));
        assert_eq!(parse_duration("\n  3.2 \n"), Some(3.2));
        assert_eq!(parse_duration("N/A\n"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let service = FfmpegVideoService::new(
            "/nonexistent/ffmpeg-binary",
            "/nonexistent/ffprobe-binary",
        );
        let result = service.get_duration(Path::new("clip.mp4")).await;
        assert!(matches!(result, Err(VideoError::Spawn { .. })));
    }
}

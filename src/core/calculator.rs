use crate::config::AppConfig;
use crate::core::fs::FileSystem;
use crate::core::hash::{HashError, HashService};
use crate::core::ids::IdGenerator;
use crate::core::video::{VideoError, VideoService};
use crate::database::models::{Content, ContentHash, ContentType, HashMetadata, HashType};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Upper bound on dHash frames sampled from one video.
pub const MAX_SAMPLED_FRAMES: usize = 5;
/// Sampled frames are never closer together than this.
pub const MIN_FRAME_INTERVAL_SECS: f64 = 1.0;

#[derive(Error, Debug)]
pub enum CalculatorError {
    #[error("Hash error: {0}")]
    Hash(#[from] HashError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Video error: {0}")]
    Video(#[from] VideoError),

    #[error("No hash calculator for content type {0}")]
    UnsupportedContentType(ContentType),

    #[error("Invalid duration {duration} for {path}")]
    InvalidDuration { path: String, duration: f64 },

    #[error("Hashing task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Number of frames sampled from a clip of `duration` seconds.
pub fn frame_count(duration: f64) -> usize {
    let max_frames = (duration / MIN_FRAME_INTERVAL_SECS).floor();
    if max_frames.is_nan() || max_frames < 1.0 {
        return 1;
    }
    (max_frames as usize).min(MAX_SAMPLED_FRAMES)
}

/// Evenly spaced timestamps strictly inside the clip, ascending.
pub fn sample_timestamps(duration: f64) -> Vec<f64> {
    let count = frame_count(duration);
    let interval = duration / (count + 1) as f64;
    (1..=count).map(|i| interval * i as f64).collect()
}

async fn sha256_blocking(hash: HashService, path: PathBuf) -> Result<String, CalculatorError> {
    let value = tokio::task::spawn_blocking(move || hash.calc_sha256(&path)).await??;
    Ok(value)
}

async fn dhash_blocking(
    hash: HashService,
    path: PathBuf,
    size: u32,
) -> Result<String, CalculatorError> {
    let value = tokio::task::spawn_blocking(move || hash.calc_dhash(&path, size)).await??;
    Ok(value)
}

/// One sha256 of the file bytes.
#[derive(Clone)]
pub struct ImageHashCalculator {
    hash: HashService,
    storage_root: PathBuf,
    ids: Arc<dyn IdGenerator>,
}

impl ImageHashCalculator {
    pub async fn calculate(&self, content: &Content) -> Result<Vec<ContentHash>, CalculatorError> {
        let path = content.resolve_path(&self.storage_root);
        let value = sha256_blocking(self.hash, path).await?;

        Ok(vec![ContentHash {
            id: self.ids.generate("hash"),
            content_id: content.id.clone(),
            hash_type: HashType::Sha256,
            value,
            metadata: None,
        }])
    }
}

/// A sha256 of the whole file plus one dHash per sampled frame.
#[derive(Clone)]
pub struct VideoHashCalculator {
    hash: HashService,
    storage_root: PathBuf,
    temp_root: PathBuf,
    dhash_size: u32,
    video: Arc<dyn VideoService>,
    fs: Arc<dyn FileSystem>,
    ids: Arc<dyn IdGenerator>,
}

impl VideoHashCalculator {
    pub async fn calculate(&self, content: &Content) -> Result<Vec<ContentHash>, CalculatorError> {
        let path = content.resolve_path(&self.storage_root);

        let sha256 = sha256_blocking(self.hash, path.clone()).await?;
        let mut hashes = vec![ContentHash {
            id: self.ids.generate("hash"),
            content_id: content.id.clone(),
            hash_type: HashType::Sha256,
            value: sha256,
            metadata: None,
        }];

        let duration = self.video.get_duration(&path).await?;
        if !duration.is_finite() || duration <= 0.0 {
            return Err(CalculatorError::InvalidDuration {
                path: path.display().to_string(),
                duration,
            });
        }

        let timestamps = sample_timestamps(duration);
        let work_dir = self.temp_root.join(self.ids.generate("frames"));
        debug!(
            "Sampling {} frames from {} into {}",
            timestamps.len(),
            path.display(),
            work_dir.display()
        );

        let frames = self
            .hash_frames(content, &path, &work_dir, &timestamps)
            .await;
        let cleanup = self.fs.delete_directory(&work_dir).await;

        match (frames, cleanup) {
            (Ok(frames), Ok(())) => {
                hashes.extend(frames);
                Ok(hashes)
            }
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(cleanup_err)) => {
                warn!(
                    "Failed to remove frame directory {}: {}",
                    work_dir.display(),
                    cleanup_err
                );
                Err(e)
            }
        }
    }

    async fn hash_frames(
        &self,
        content: &Content,
        path: &Path,
        work_dir: &Path,
        timestamps: &[f64],
    ) -> Result<Vec<ContentHash>, CalculatorError> {
        self.fs.create_directory(work_dir).await?;

        let mut hashes = Vec::with_capacity(timestamps.len());
        for (i, &timestamp) in timestamps.iter().enumerate() {
            let frame_path = work_dir.join(format!("frame_{}.png", i + 1));
            self.video
                .extract_frame(path, timestamp, &frame_path)
                .await?;

            let value = dhash_blocking(self.hash, frame_path.clone(), self.dhash_size).await?;
            self.fs.delete(&frame_path).await?;

            hashes.push(ContentHash {
                id: self.ids.generate("hash"),
                content_id: content.id.clone(),
                hash_type: HashType::DHash,
                value,
                metadata: Some(HashMetadata::scene(timestamp)),
            });
        }
        Ok(hashes)
    }
}

pub enum HashCalculator {
    Image(ImageHashCalculator),
    Video(VideoHashCalculator),
}

impl HashCalculator {
    pub async fn calculate(&self, content: &Content) -> Result<Vec<ContentHash>, CalculatorError> {
        match self {
            HashCalculator::Image(calculator) => calculator.calculate(content).await,
            HashCalculator::Video(calculator) => calculator.calculate(content).await,
        }
    }
}

/// Builds the calculator for a content type with the dependencies it needs.
#[derive(Clone)]
pub struct CalculatorFactory {
    hash: HashService,
    storage_root: PathBuf,
    temp_root: PathBuf,
    dhash_size: u32,
    video: Arc<dyn VideoService>,
    fs: Arc<dyn FileSystem>,
    ids: Arc<dyn IdGenerator>,
}

impl CalculatorFactory {
    pub fn new(
        config: &AppConfig,
        video: Arc<dyn VideoService>,
        fs: Arc<dyn FileSystem>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            hash: HashService::new(),
            storage_root: config.storage_root.clone(),
            temp_root: config.temp_root(),
            dhash_size: config.dhash_size,
            video,
            fs,
            ids,
        }
    }

    pub fn calculator_for(
        &self,
        content_type: ContentType,
    ) -> Result<HashCalculator, CalculatorError> {
        match content_type {
            ContentType::Image => Ok(HashCalculator::Image(ImageHashCalculator {
                hash: self.hash,
                storage_root: self.storage_root.clone(),
                ids: self.ids.clone(),
            })),
            ContentType::Video => Ok(HashCalculator::Video(VideoHashCalculator {
                hash: self.hash,
                storage_root: self.storage_root.clone(),
                temp_root: self.temp_root.clone(),
                dhash_size: self.dhash_size,
                video: self.video.clone(),
                fs: self.fs.clone(),
                ids: self.ids.clone(),
            })),
            ContentType::Audio => Err(CalculatorError::UnsupportedContentType(content_type)),
        }
    }

    pub async fn calculate(&self, content: &Content) -> Result<Vec<ContentHash>, CalculatorError> {
        self.calculator_for(content.content_type)?
            .calculate(content)
            .await
    }
}

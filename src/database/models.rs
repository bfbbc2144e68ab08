use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

// Content models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Image,
    Video,
    Audio,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Image => "image",
            ContentType::Video => "video",
            ContentType::Audio => "audio",
        }
    }

    /// Classify a file by extension; `None` for files the library does not manage.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "gif" | "bmp" | "tiff" | "tif" | "webp" => {
                Some(ContentType::Image)
            }
            "mp4" | "mov" | "avi" | "mkv" | "m4v" | "webm" | "wmv" | "flv" => {
                Some(ContentType::Video)
            }
            "mp3" | "flac" | "wav" | "ogg" | "m4a" | "aac" => Some(ContentType::Audio),
            _ => None,
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ContentType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "image" => Ok(ContentType::Image),
            "video" => Ok(ContentType::Video),
            "audio" => Ok(ContentType::Audio),
            other => Err(format!("unknown content type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub id: String,
    pub path: String,
    pub name: String,
    pub content_type: ContentType,
}

impl Content {
    /// Location of the file on disk: `storage_root/path/name`.
    pub fn resolve_path(&self, storage_root: &Path) -> PathBuf {
        storage_root.join(&self.path).join(&self.name)
    }
}

// Content hash models
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashType {
    Sha256,
    DHash,
    Other(String),
}

impl HashType {
    pub fn as_str(&self) -> &str {
        match self {
            HashType::Sha256 => "sha256",
            HashType::DHash => "dhash",
            HashType::Other(tag) => tag,
        }
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for HashType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "sha256" => HashType::Sha256,
            "dhash" => HashType::DHash,
            _ => HashType::Other(s),
        }
    }
}

impl From<&str> for HashType {
    fn from(s: &str) -> Self {
        HashType::from(s.to_string())
    }
}

impl From<HashType> for String {
    fn from(hash_type: HashType) -> Self {
        hash_type.as_str().to_string()
    }
}

/// Provenance of a hash derived from a sampled video frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashMetadata {
    pub source: String,
    pub timestamp: f64,
}

impl HashMetadata {
    pub fn scene(timestamp: f64) -> Self {
        Self {
            source: "scene".to_string(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentHash {
    pub id: String,
    pub content_id: String,
    pub hash_type: HashType,
    pub value: String,
    pub metadata: Option<HashMetadata>,
}

// Scan queue models
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanQueueItem {
    pub id: i64,
    pub content_hash_id: String,
    pub created_at: String,
}

/// A pending queue entry joined to the hash it refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanQueueEntry {
    pub id: i64,
    pub content_hash_id: String,
    pub content_id: String,
    pub hash_type: HashType,
    pub value: String,
}

// Duplicate group models
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroupItem {
    pub content_id: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub id: String,
    pub hash_type: HashType,
    pub items: Vec<DuplicateGroupItem>,
    pub created_at: String,
    pub updated_at: String,
}

impl DuplicateGroup {
    pub fn contains(&self, content_id: &str) -> bool {
        self.items.iter().any(|item| item.content_id == content_id)
    }
}

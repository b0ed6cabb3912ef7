//! Typed subset of the Audiobookshelf API payloads the bridge consumes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub user: AbsUser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AbsUser {
    pub id: String,
    pub username: String,
    /// API token used as Bearer auth on every subsequent call.
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LibrariesResponse {
    pub libraries: Vec<Library>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Library {
    pub id: String,
    pub name: String,
    #[serde(rename = "mediaType")]
    pub media_type: String,
}

impl Library {
    pub fn is_book_library(&self) -> bool {
        self.media_type == "book"
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LibraryItemsPage {
    #[serde(default)]
    pub results: Vec<LibraryItemSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LibraryItemSummary {
    pub id: String,
    #[serde(rename = "addedAt")]
    pub added_at: Option<i64>,
    pub media: Option<MediaSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaSummary {
    pub duration: Option<f64>,
    pub metadata: Option<MediaMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaMetadata {
    pub title: Option<String>,
    #[serde(rename = "authorName")]
    pub author_name: Option<String>,
}

/// Expanded library item with its ordered audio files.
#[derive(Debug, Clone, Deserialize)]
pub struct LibraryItem {
    pub id: String,
    pub media: Media,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Media {
    pub duration: Option<f64>,
    #[serde(rename = "audioFiles", default)]
    pub audio_files: Vec<AudioFile>,
    pub metadata: Option<MediaMetadata>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioFile {
    pub index: Option<u32>,
    pub duration: Option<f64>,
    pub metadata: FileMetadata,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileMetadata {
    /// Path as ABS sees it; translated by the bridge's path mapper.
    pub path: String,
    pub size: Option<u64>,
    #[serde(rename = "mtimeMs")]
    pub mtime_ms: Option<i64>,
}

impl LibraryItem {
    pub fn title(&self) -> &str {
        self.media
            .metadata
            .as_ref()
            .and_then(|m| m.title.as_deref())
            .unwrap_or("Unknown title")
    }

    pub fn author(&self) -> &str {
        self.media
            .metadata
            .as_ref()
            .and_then(|m| m.author_name.as_deref())
            .unwrap_or("Unknown author")
    }

    /// Audio files in playback order.
    pub fn ordered_audio_files(&self) -> Vec<&AudioFile> {
        let mut files: Vec<&AudioFile> = self.media.audio_files.iter().collect();
        files.sort_by_key(|f| f.index.unwrap_or(u32::MAX));
        files
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaProgress {
    #[serde(rename = "currentTime")]
    pub current_time: f64,
    pub duration: Option<f64>,
    pub progress: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    #[serde(rename = "currentTime")]
    pub current_time: f64,
    pub duration: f64,
    pub progress: f64,
}

impl ProgressUpdate {
    pub fn new(current_time: f64, duration: f64) -> Self {
        let progress = if duration > 0.0 {
            (current_time / duration).clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            current_time,
            duration,
            progress,
        }
    }
}

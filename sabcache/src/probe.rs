//! Media probing and the renderer-compatibility policy.
//!
//! `ffprobe` tells us what a source file actually contains; the policy
//! table decides whether the bytes can be served as-is, need repackaging
//! into the codec's preferred container, or need a full re-encode to MP3.

use crate::error::{CacheError, Result};
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::trace;

/// Revision tag of the decision table below. Entries recorded under an
/// older tag are rebuilt.
pub const PROFILE_VERSION: &str = "sonos-v1";

/// Artifact containers the target renderers accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFormat {
    Mp3,
    M4a,
    Flac,
    Ogg,
    Wma,
}

impl CacheFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            CacheFormat::Mp3 => "mp3",
            CacheFormat::M4a => "m4a",
            CacheFormat::Flac => "flac",
            CacheFormat::Ogg => "ogg",
            CacheFormat::Wma => "wma",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            CacheFormat::Mp3 => "audio/mpeg",
            CacheFormat::M4a => "audio/mp4",
            CacheFormat::Flac => "audio/flac",
            CacheFormat::Ogg => "audio/ogg",
            CacheFormat::Wma => "audio/x-ms-wma",
        }
    }

    /// ffmpeg muxer name. The `ipod` muxer writes the M4A brand with the
    /// moov atom ZonePlayers need for progressive streaming.
    pub fn muxer(&self) -> &'static str {
        match self {
            CacheFormat::Mp3 => "mp3",
            CacheFormat::M4a => "ipod",
            CacheFormat::Flac => "flac",
            CacheFormat::Ogg => "ogg",
            CacheFormat::Wma => "asf",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mp3" => Some(CacheFormat::Mp3),
            "m4a" | "mp4" => Some(CacheFormat::M4a),
            "flac" => Some(CacheFormat::Flac),
            "ogg" => Some(CacheFormat::Ogg),
            "wma" => Some(CacheFormat::Wma),
            _ => None,
        }
    }
}

/// What `ffprobe` reported about a source file.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    /// Demuxer name list, e.g. `mov,mp4,m4a,3gp,3g2,mj2`.
    pub container: String,
    pub codec: String,
    pub bitrate: Option<u64>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u32>,
    pub duration_sec: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// Bytes are served as-is.
    Compatible,
    /// Codec is fine, container is not: repackage without re-encoding.
    NeedsRemux,
    /// Codec is not accepted: re-encode to MP3.
    NeedsTranscode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildStrategy {
    pub compatibility: Compatibility,
    pub format: CacheFormat,
}

/// Container extensions that count as "preferred" for each accepted codec.
/// Note `.m4b` is deliberately absent from the AAC row: renderers choke on
/// its chapter atoms, so m4b always goes through a remux.
fn accepted_codec_format(codec: &str) -> Option<(CacheFormat, &'static [&'static str])> {
    match codec {
        "mp3" => Some((CacheFormat::Mp3, &["mp3"])),
        "aac" => Some((CacheFormat::M4a, &["m4a", "mp4"])),
        "flac" => Some((CacheFormat::Flac, &["flac"])),
        "vorbis" => Some((CacheFormat::Ogg, &["ogg", "oga"])),
        "wmav2" => Some((CacheFormat::Wma, &["wma"])),
        _ => None,
    }
}

/// The compatibility decision table. `source_ext` is the lowercased file
/// extension; it is what distinguishes an `.m4b` audiobook from a plain
/// `.m4a` even though ffprobe reports the same demuxer for both.
pub fn classify(info: &MediaInfo, source_ext: &str) -> BuildStrategy {
    let Some((format, preferred_exts)) = accepted_codec_format(&info.codec) else {
        return BuildStrategy {
            compatibility: Compatibility::NeedsTranscode,
            format: CacheFormat::Mp3,
        };
    };

    if preferred_exts.contains(&source_ext) {
        BuildStrategy {
            compatibility: Compatibility::Compatible,
            format,
        }
    } else {
        BuildStrategy {
            compatibility: Compatibility::NeedsRemux,
            format,
        }
    }
}

pub fn source_extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

// ---- ffprobe invocation ----

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
    duration: Option<String>,
}

/// Probes one file.
pub async fn probe(ffprobe_bin: &str, input: &Path) -> Result<MediaInfo> {
    if !input.exists() {
        return Err(CacheError::InputMissing(input.to_path_buf()));
    }

    let output = Command::new(ffprobe_bin)
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(input)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CacheError::ToolMissing(ffprobe_bin.to_string())
            } else {
                CacheError::Io(e)
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CacheError::ProbeFailed(format!(
            "{}: {}",
            input.display(),
            stderr.trim()
        )));
    }

    parse_ffprobe_output(&output.stdout, input)
}

/// Parses ffprobe JSON into a [`MediaInfo`].
pub fn parse_ffprobe_output(json: &[u8], input: &Path) -> Result<MediaInfo> {
    let parsed: FfprobeOutput = serde_json::from_slice(json)?;

    let audio = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("audio"))
        .ok_or_else(|| CacheError::NoAudioStream(input.to_path_buf()))?;

    let format = parsed.format.as_ref();

    let duration_sec = format
        .and_then(|f| f.duration.as_deref())
        .or(audio.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    let info = MediaInfo {
        container: format
            .and_then(|f| f.format_name.clone())
            .unwrap_or_default(),
        codec: audio.codec_name.clone().unwrap_or_default(),
        bitrate: format
            .and_then(|f| f.bit_rate.as_deref())
            .and_then(|b| b.parse().ok()),
        sample_rate: audio.sample_rate.as_deref().and_then(|s| s.parse().ok()),
        channels: audio.channels,
        duration_sec,
    };

    trace!("Probed {}: {:?}", input.display(), info);
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn info(codec: &str, container: &str) -> MediaInfo {
        MediaInfo {
            container: container.to_string(),
            codec: codec.to_string(),
            bitrate: Some(128_000),
            sample_rate: Some(44_100),
            channels: Some(2),
            duration_sec: 1800.0,
        }
    }

    #[test]
    fn aac_in_m4b_needs_remux_to_m4a() {
        let strategy = classify(&info("aac", "mov,mp4,m4a,3gp,3g2,mj2"), "m4b");
        assert_eq!(strategy.compatibility, Compatibility::NeedsRemux);
        assert_eq!(strategy.format, CacheFormat::M4a);
    }

    #[test]
    fn aac_in_m4a_is_compatible() {
        let strategy = classify(&info("aac", "mov,mp4,m4a,3gp,3g2,mj2"), "m4a");
        assert_eq!(strategy.compatibility, Compatibility::Compatible);
        assert_eq!(strategy.format, CacheFormat::M4a);
    }

    #[test]
    fn mp3_in_mp3_is_compatible() {
        let strategy = classify(&info("mp3", "mp3"), "mp3");
        assert_eq!(strategy.compatibility, Compatibility::Compatible);
        assert_eq!(strategy.format, CacheFormat::Mp3);
    }

    #[test]
    fn mp3_in_foreign_container_remuxes_to_mp3() {
        let strategy = classify(&info("mp3", "matroska,webm"), "mkv");
        assert_eq!(strategy.compatibility, Compatibility::NeedsRemux);
        assert_eq!(strategy.format, CacheFormat::Mp3);
    }

    #[test]
    fn unknown_codec_transcodes_to_mp3() {
        let strategy = classify(&info("opus", "ogg"), "opus");
        assert_eq!(strategy.compatibility, Compatibility::NeedsTranscode);
        assert_eq!(strategy.format, CacheFormat::Mp3);
    }

    #[test]
    fn accepted_codecs_are_deterministic() {
        // Same input always classifies the same way
        for _ in 0..3 {
            let a = classify(&info("flac", "flac"), "flac");
            assert_eq!(a.compatibility, Compatibility::Compatible);
            let b = classify(&info("vorbis", "ogg"), "ogg");
            assert_eq!(b.compatibility, Compatibility::Compatible);
            let c = classify(&info("wmav2", "asf"), "wma");
            assert_eq!(c.compatibility, Compatibility::Compatible);
        }
    }

    #[test]
    fn parse_ffprobe_json() {
        let json = br#"{
            "streams": [
                {"codec_type": "video", "codec_name": "mjpeg"},
                {"codec_type": "audio", "codec_name": "aac",
                 "sample_rate": "44100", "channels": 2}
            ],
            "format": {
                "format_name": "mov,mp4,m4a,3gp,3g2,mj2",
                "duration": "10000.250000",
                "bit_rate": "128000"
            }
        }"#;

        let info = parse_ffprobe_output(json, &PathBuf::from("x.m4b")).unwrap();
        assert_eq!(info.codec, "aac");
        assert_eq!(info.duration_sec, 10000.25);
        assert_eq!(info.bitrate, Some(128_000));
        assert_eq!(info.sample_rate, Some(44_100));
        assert_eq!(info.channels, Some(2));
    }

    #[test]
    fn missing_audio_stream_detected() {
        let json = br#"{"streams": [{"codec_type": "video", "codec_name": "h264"}],
                        "format": {"format_name": "mov"}}"#;
        let err = parse_ffprobe_output(json, &PathBuf::from("x.mp4")).unwrap_err();
        assert!(matches!(err, CacheError::NoAudioStream(_)));
    }

    #[test]
    fn format_parse_round_trip() {
        for f in [
            CacheFormat::Mp3,
            CacheFormat::M4a,
            CacheFormat::Flac,
            CacheFormat::Ogg,
            CacheFormat::Wma,
        ] {
            assert_eq!(CacheFormat::parse(f.extension()), Some(f));
        }
        assert_eq!(CacheFormat::parse("avi"), None);
    }

    #[test]
    fn extension_helper() {
        assert_eq!(source_extension(Path::new("/a/b/Book.M4B")), "m4b");
        assert_eq!(source_extension(Path::new("/a/b/noext")), "");
    }
}

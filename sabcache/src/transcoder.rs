//! ffmpeg invocation: copy-through, remux, transcode, segmented variants.
//!
//! Every artifact is written to a `.tmp` sibling (or a `.segments.tmp`
//! directory) and renamed into place only on success, so `is_cached` can
//! never observe a half-written file. Chapter metadata and non-audio
//! streams are always stripped: ZonePlayers stall on chapter/bin_data
//! streams. The spawned process is tied to the build's cancellation token.

use crate::error::{CacheError, Result};
use crate::probe::{self, CacheFormat, MediaInfo};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default length of one cached segment (2 h). Old ZP-class renderers run
/// out of RAM buffering anything much longer.
pub const DEFAULT_SEGMENT_DURATION_SEC: u64 = 7200;

/// Disk headroom multiplier applied to the size estimate.
const DISK_SPACE_MARGIN: f64 = 1.1;

const STDERR_TAIL_CHARS: usize = 2000;

const MP3_BITRATE: &str = "128k";
const MP3_SAMPLE_RATE: &str = "44100";
const MP3_CHANNELS: &str = "2";

#[derive(Debug, Clone)]
pub struct Transcoder {
    ffmpeg_bin: String,
    ffprobe_bin: String,
}

impl Default for Transcoder {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

impl Transcoder {
    pub fn new(ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
        }
    }

    pub async fn probe(&self, input: &Path) -> Result<MediaInfo> {
        probe::probe(&self.ffprobe_bin, input).await
    }

    pub async fn duration(&self, input: &Path) -> Result<f64> {
        Ok(self.probe(input).await?.duration_sec)
    }

    /// Requires at least `bytes_needed * 1.1` free at `dir`.
    pub fn check_disk_space(&self, dir: &Path, bytes_needed: u64) -> Result<()> {
        let needed = (bytes_needed as f64 * DISK_SPACE_MARGIN) as u64;
        match available_space(dir) {
            Some(available) if available < needed => {
                Err(CacheError::InsufficientDiskSpace { needed, available })
            }
            Some(_) => Ok(()),
            None => {
                debug!("No disk stats for {}; skipping space check", dir.display());
                Ok(())
            }
        }
    }

    /// Repackage (or pass through) without re-encoding. Multiple inputs are
    /// concatenated with the concat demuxer and must share a codec.
    pub async fn copy_remux(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        format: CacheFormat,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.build_whole_file(inputs, output, format, copy_codec_args(), cancel)
            .await
    }

    /// Re-encode to the default MP3 profile (128 kbps, 44.1 kHz, stereo).
    pub async fn transcode(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.build_whole_file(inputs, output, CacheFormat::Mp3, mp3_encode_args(), cancel)
            .await
    }

    /// Split one input into fixed-duration segments without re-encoding.
    /// Returns the published segment paths in order.
    pub async fn remux_segmented(
        &self,
        input: &Path,
        output_dir: &Path,
        format: CacheFormat,
        segment_duration: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        self.build_segmented(
            input,
            output_dir,
            format,
            segment_duration,
            copy_codec_args(),
            cancel,
        )
        .await
    }

    /// Split one input into fixed-duration MP3 segments, re-encoding.
    pub async fn transcode_segmented(
        &self,
        input: &Path,
        output_dir: &Path,
        segment_duration: u64,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        self.build_segmented(
            input,
            output_dir,
            CacheFormat::Mp3,
            segment_duration,
            mp3_encode_args(),
            cancel,
        )
        .await
    }

    async fn build_whole_file(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        format: CacheFormat,
        codec_args: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        check_inputs(inputs)?;
        let tmp = tmp_path(output);

        let (input_args, concat_list) = self.input_args(inputs, output).await?;
        let args = whole_file_args(&input_args, &codec_args, format, &tmp);

        let result = self.run_tool(args, cancel).await;

        if let Some(list) = &concat_list {
            let _ = tokio::fs::remove_file(list).await;
        }

        match result {
            Ok(()) => {
                tokio::fs::rename(&tmp, output).await?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }

    async fn build_segmented(
        &self,
        input: &Path,
        output_dir: &Path,
        format: CacheFormat,
        segment_duration: u64,
        codec_args: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PathBuf>> {
        check_inputs(std::slice::from_ref(&input.to_path_buf()))?;

        let staging = output_dir.join(".segments.tmp");
        if staging.exists() {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&staging).await?;

        let pattern = staging.join(format!("segment_%03d.{}", format.extension()));
        let args = segmented_args(input, &codec_args, format, segment_duration, &pattern);

        match self.run_tool(args, cancel).await {
            Ok(()) => {}
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(e);
            }
        }

        // Publish: per-file rename from the staging dir, then drop it
        let mut produced = list_segment_files(&staging).await?;
        if produced.is_empty() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(CacheError::BuildFailed(format!(
                "segment split of {} produced no files",
                input.display()
            )));
        }
        produced.sort();

        let mut published = Vec::with_capacity(produced.len());
        for file in &produced {
            let name = file.file_name().unwrap_or_default();
            let target = output_dir.join(name);
            tokio::fs::rename(file, &target).await?;
            published.push(target);
        }
        let _ = tokio::fs::remove_dir_all(&staging).await;

        Ok(published)
    }

    /// Input arguments; writes a concat list file for multi-input builds
    /// and returns its path so the caller can remove it.
    async fn input_args(
        &self,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Result<(Vec<String>, Option<PathBuf>)> {
        if inputs.len() == 1 {
            return Ok((
                vec!["-i".to_string(), inputs[0].to_string_lossy().into_owned()],
                None,
            ));
        }

        let list_path = output.with_extension("concat.tmp");
        let mut list = String::new();
        for input in inputs {
            // Concat demuxer quoting: single quotes, embedded quotes escaped
            let escaped = input.to_string_lossy().replace('\'', r"'\''");
            list.push_str(&format!("file '{}'\n", escaped));
        }
        tokio::fs::write(&list_path, list).await?;

        Ok((
            vec![
                "-f".to_string(),
                "concat".to_string(),
                "-safe".to_string(),
                "0".to_string(),
                "-i".to_string(),
                list_path.to_string_lossy().into_owned(),
            ],
            Some(list_path),
        ))
    }

    async fn run_tool(&self, args: Vec<String>, cancel: &CancellationToken) -> Result<()> {
        debug!("{} {}", self.ffmpeg_bin, args.join(" "));

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CacheError::ToolMissing(self.ffmpeg_bin.clone())
                } else {
                    CacheError::Io(e)
                }
            })?;

        // Drain stderr concurrently so a chatty run cannot fill the pipe
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut buf = String::new();
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                warn!("Build cancelled, killing {}", self.ffmpeg_bin);
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(CacheError::Cancelled);
            }
        };

        let stderr_text = stderr_task.await.unwrap_or_default();
        map_exit_status(status.code(), &stderr_text)
    }
}

fn check_inputs(inputs: &[PathBuf]) -> Result<()> {
    if inputs.is_empty() {
        return Err(CacheError::InvalidInput("no input files".to_string()));
    }
    for input in inputs {
        if !input.exists() {
            return Err(CacheError::InputMissing(input.clone()));
        }
    }
    Ok(())
}

fn tmp_path(output: &Path) -> PathBuf {
    PathBuf::from(format!("{}.tmp", output.display()))
}

async fn list_segment_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}

fn available_space(dir: &Path) -> Option<u64> {
    use sysinfo::Disks;

    let target = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    // Longest mount-point prefix wins
    disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

/// ffmpeg's conventional exit codes mapped to typed errors: anything killed
/// (SIGKILL / 137) counts as cancellation, everything else carries the code
/// and the stderr tail.
fn map_exit_status(code: Option<i32>, stderr: &str) -> Result<()> {
    match code {
        Some(0) => Ok(()),
        None | Some(137) => Err(CacheError::Cancelled),
        Some(c) => Err(CacheError::ToolFailed {
            exit_code: c,
            stderr_tail: stderr_tail(stderr),
        }),
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let char_count = trimmed.chars().count();
    if char_count <= STDERR_TAIL_CHARS {
        return trimmed.to_string();
    }
    trimmed
        .chars()
        .skip(char_count - STDERR_TAIL_CHARS)
        .collect()
}

// ---- Argument builders (pure, unit-tested) ----

fn base_args() -> Vec<String> {
    vec!["-y".to_string(), "-hide_banner".to_string(), "-nostdin".to_string()]
}

/// Keep the first audio stream, drop chapters, global metadata, video
/// (cover art), subtitles and data streams.
fn strip_args() -> Vec<String> {
    [
        "-map", "0:a:0", "-map_metadata", "-1", "-map_chapters", "-1", "-vn", "-sn", "-dn",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn copy_codec_args() -> Vec<String> {
    vec!["-c:a".to_string(), "copy".to_string()]
}

fn mp3_encode_args() -> Vec<String> {
    vec![
        "-c:a".to_string(),
        "libmp3lame".to_string(),
        "-b:a".to_string(),
        MP3_BITRATE.to_string(),
        "-ar".to_string(),
        MP3_SAMPLE_RATE.to_string(),
        "-ac".to_string(),
        MP3_CHANNELS.to_string(),
    ]
}

fn mux_args(format: CacheFormat) -> Vec<String> {
    let mut args = vec!["-f".to_string(), format.muxer().to_string()];
    if format == CacheFormat::M4a {
        args.push("-movflags".to_string());
        args.push("+faststart".to_string());
    }
    args
}

fn whole_file_args(
    input_args: &[String],
    codec_args: &[String],
    format: CacheFormat,
    tmp_output: &Path,
) -> Vec<String> {
    let mut args = base_args();
    args.extend_from_slice(input_args);
    args.extend(strip_args());
    args.extend_from_slice(codec_args);
    args.extend(mux_args(format));
    args.push(tmp_output.to_string_lossy().into_owned());
    args
}

fn segmented_args(
    input: &Path,
    codec_args: &[String],
    format: CacheFormat,
    segment_duration: u64,
    pattern: &Path,
) -> Vec<String> {
    let mut args = base_args();
    args.push("-i".to_string());
    args.push(input.to_string_lossy().into_owned());
    args.extend(strip_args());
    args.extend_from_slice(codec_args);
    args.extend([
        "-f".to_string(),
        "segment".to_string(),
        "-segment_time".to_string(),
        segment_duration.to_string(),
        "-reset_timestamps".to_string(),
        "1".to_string(),
        "-segment_format".to_string(),
        format.muxer().to_string(),
    ]);
    if format == CacheFormat::M4a {
        args.push("-segment_format_options".to_string());
        args.push("movflags=+faststart".to_string());
    }
    args.push(pattern.to_string_lossy().into_owned());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_file_remux_args() {
        let args = whole_file_args(
            &["-i".to_string(), "/media/book/01.m4b".to_string()],
            &copy_codec_args(),
            CacheFormat::M4a,
            Path::new("/cache/item/audio.m4a.tmp"),
        );

        let joined = args.join(" ");
        assert!(joined.starts_with("-y -hide_banner -nostdin"));
        assert!(joined.contains("-i /media/book/01.m4b"));
        assert!(joined.contains("-map 0:a:0"));
        assert!(joined.contains("-map_chapters -1"));
        assert!(joined.contains("-map_metadata -1"));
        assert!(joined.contains("-c:a copy"));
        assert!(joined.contains("-f ipod"));
        assert!(joined.contains("-movflags +faststart"));
        assert!(joined.ends_with("/cache/item/audio.m4a.tmp"));
    }

    #[test]
    fn transcode_args_use_default_profile() {
        let args = whole_file_args(
            &["-i".to_string(), "in.opus".to_string()],
            &mp3_encode_args(),
            CacheFormat::Mp3,
            Path::new("audio.mp3.tmp"),
        );

        let joined = args.join(" ");
        assert!(joined.contains("-c:a libmp3lame"));
        assert!(joined.contains("-b:a 128k"));
        assert!(joined.contains("-ar 44100"));
        assert!(joined.contains("-ac 2"));
        assert!(joined.contains("-f mp3"));
        assert!(!joined.contains("faststart"));
    }

    #[test]
    fn segment_args_shape() {
        let args = segmented_args(
            Path::new("/media/long.m4b"),
            &copy_codec_args(),
            CacheFormat::M4a,
            7200,
            Path::new("/cache/item/.segments.tmp/segment_%03d.m4a"),
        );

        let joined = args.join(" ");
        assert!(joined.contains("-f segment"));
        assert!(joined.contains("-segment_time 7200"));
        assert!(joined.contains("-reset_timestamps 1"));
        assert!(joined.contains("-segment_format ipod"));
        assert!(joined.contains("-segment_format_options movflags=+faststart"));
        assert!(joined.ends_with("segment_%03d.m4a"));
    }

    #[test]
    fn exit_code_mapping() {
        assert!(map_exit_status(Some(0), "").is_ok());
        assert!(matches!(
            map_exit_status(Some(1), "boom"),
            Err(CacheError::ToolFailed { exit_code: 1, .. })
        ));
        assert!(matches!(
            map_exit_status(Some(2), ""),
            Err(CacheError::ToolFailed { exit_code: 2, .. })
        ));
        assert!(matches!(
            map_exit_status(Some(137), ""),
            Err(CacheError::Cancelled)
        ));
        assert!(matches!(map_exit_status(None, ""), Err(CacheError::Cancelled)));
    }

    #[test]
    fn stderr_tail_truncates_front() {
        let long = "x".repeat(3000) + "END";
        let tail = stderr_tail(&long);
        assert_eq!(tail.chars().count(), STDERR_TAIL_CHARS);
        assert!(tail.ends_with("END"));

        assert_eq!(stderr_tail("  short  "), "short");
    }

    #[test]
    fn tmp_path_appends_suffix() {
        assert_eq!(
            tmp_path(Path::new("/cache/i/audio.m4a")),
            PathBuf::from("/cache/i/audio.m4a.tmp")
        );
    }

    #[tokio::test]
    async fn concat_list_written_for_multi_input() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("01.mp3");
        let b = dir.path().join("02 it's.mp3");
        tokio::fs::write(&a, b"x").await.unwrap();
        tokio::fs::write(&b, b"x").await.unwrap();

        let transcoder = Transcoder::default();
        let output = dir.path().join("audio.mp3");
        let (args, list) = transcoder
            .input_args(&[a.clone(), b.clone()], &output)
            .await
            .unwrap();

        assert_eq!(args[0], "-f");
        assert_eq!(args[1], "concat");
        let list_path = list.unwrap();
        let content = tokio::fs::read_to_string(&list_path).await.unwrap();
        assert!(content.contains("01.mp3'"));
        // Embedded quote escaped for the concat demuxer
        assert!(content.contains(r"it'\''s"));
    }

    #[tokio::test]
    async fn missing_input_rejected_before_spawn() {
        let transcoder = Transcoder::default();
        let cancel = CancellationToken::new();
        let err = transcoder
            .copy_remux(
                &[PathBuf::from("/no/such/file.m4b")],
                Path::new("/tmp/out.m4a"),
                CacheFormat::M4a,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InputMissing(_)));
    }
}

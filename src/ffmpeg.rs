//! Production codec/container service backed by an external `ffmpeg` process.
//!
//! The pipelines speak chunks; here "encoding" frames raw payloads into
//! timestamped chunks and the container writer routes them into two raw
//! intermediate streams. Finalize runs one ffmpeg invocation that compresses
//! both streams (H.264 + AAC) and muxes them into a single MP4. The video
//! phase fully precedes the audio phase, so both streams are complete by the
//! time ffmpeg starts.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, warn};
use tempfile::NamedTempFile;

use crate::codec::{
    AudioEncoder, ChunkMeta, ContainerWriter, EncodedChunk, Track, VideoEncoder, CHANNELS,
    FRAME_HEIGHT, FRAME_RATE, FRAME_WIDTH, SAMPLE_RATE,
};
use crate::convert::CodecServices;
use crate::synth::{ClipSource, ClipTable, DecodedClip};

const VIDEO_BITRATE: &str = "2500k";
const AUDIO_BITRATE: &str = "128k";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfmpegMode {
    Auto,
    System,
    Sidecar,
}

pub fn resolve_ffmpeg_path(mode: FfmpegMode) -> Result<PathBuf> {
    match mode {
        FfmpegMode::Auto | FfmpegMode::System => Ok(PathBuf::from("ffmpeg")),
        FfmpegMode::Sidecar => {
            #[cfg(feature = "sidecar_ffmpeg")]
            {
                let path = ffmpeg_sidecar::paths::ffmpeg_path();
                if !path.exists() {
                    ffmpeg_sidecar::download::auto_download()
                        .context("failed to auto-download ffmpeg sidecar binary")?;
                }
                Ok(path)
            }
            #[cfg(not(feature = "sidecar_ffmpeg"))]
            {
                Err(anyhow!(
                    "ffmpeg sidecar mode requested but replaycast was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`."
                ))
            }
        }
    }
}

/// The production set: raw chunkers plus the ffmpeg container writer.
pub fn services(mode: FfmpegMode) -> Result<CodecServices> {
    Ok(CodecServices {
        video: Box::new(RawVideoChunker),
        audio: Box::new(RawAudioChunker),
        writer: Box::new(FfmpegWriter::new(mode)?),
    })
}

/// Frames raw RGBA payloads into chunks; the actual compression happens in
/// the container writer's ffmpeg pass.
pub struct RawVideoChunker;

impl VideoEncoder for RawVideoChunker {
    fn encode(
        &mut self,
        rgba: Vec<u8>,
        timestamp_us: u64,
        duration_us: u64,
        keyframe: bool,
    ) -> Result<Vec<EncodedChunk>> {
        Ok(vec![EncodedChunk {
            track: Track::Video,
            timestamp_us,
            duration_us,
            keyframe,
            data: rgba,
        }])
    }

    fn flush(&mut self) -> Result<Vec<EncodedChunk>> {
        Ok(Vec::new())
    }
}

/// Frames planar f32 windows into chunks.
pub struct RawAudioChunker;

impl AudioEncoder for RawAudioChunker {
    fn encode(
        &mut self,
        planar: &[f32],
        samples_per_channel: usize,
        timestamp_us: u64,
        duration_us: u64,
    ) -> Result<Vec<EncodedChunk>> {
        if planar.len() != samples_per_channel * CHANNELS {
            bail!(
                "planar window holds {} samples, expected {} per channel over {} channels",
                planar.len(),
                samples_per_channel,
                CHANNELS
            );
        }
        let mut data = Vec::with_capacity(planar.len() * 4);
        for sample in planar {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Ok(vec![EncodedChunk {
            track: Track::Audio,
            timestamp_us,
            duration_us,
            keyframe: false,
            data,
        }])
    }

    fn flush(&mut self) -> Result<Vec<EncodedChunk>> {
        Ok(Vec::new())
    }
}

pub struct FfmpegWriter {
    mode: FfmpegMode,
    video_tmp: NamedTempFile,
    audio_tmp: NamedTempFile,
}

impl FfmpegWriter {
    pub fn new(mode: FfmpegMode) -> Result<Self> {
        Ok(Self {
            mode,
            video_tmp: NamedTempFile::new().context("failed to create video temp stream")?,
            audio_tmp: NamedTempFile::new().context("failed to create audio temp stream")?,
        })
    }
}

impl ContainerWriter for FfmpegWriter {
    fn write(&mut self, chunk: &EncodedChunk) -> Result<()> {
        match chunk.track {
            Track::Video => self
                .video_tmp
                .write_all(&chunk.data)
                .context("failed to write frame to video temp stream"),
            Track::Audio => {
                let interleaved = planar_bytes_to_interleaved(&chunk.data)?;
                self.audio_tmp
                    .write_all(&interleaved)
                    .context("failed to write window to audio temp stream")
            }
        }
    }

    fn finish(&mut self, schedule: &[ChunkMeta]) -> Result<Vec<u8>> {
        self.video_tmp.flush().context("failed to flush video temp stream")?;
        self.audio_tmp.flush().context("failed to flush audio temp stream")?;
        debug!("muxing {} chunks", schedule.len());

        let output = tempfile::Builder::new()
            .suffix(".mp4")
            .tempfile()
            .context("failed to create container temp file")?;
        let args = container_args(self.video_tmp.path(), self.audio_tmp.path(), output.path());

        let ffmpeg_path = resolve_ffmpeg_path(self.mode)?;
        run_ffmpeg(&ffmpeg_path, &args)?;

        let bytes =
            std::fs::read(output.path()).context("failed to read finished container")?;
        if bytes.is_empty() {
            bail!("ffmpeg produced an empty container");
        }
        Ok(bytes)
    }
}

fn container_args(video_path: &Path, audio_path: &Path, output_path: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "-pix_fmt".to_owned(),
        "rgba".to_owned(),
        "-s:v".to_owned(),
        format!("{FRAME_WIDTH}x{FRAME_HEIGHT}"),
        "-r".to_owned(),
        FRAME_RATE.to_string(),
        "-i".to_owned(),
        video_path.to_string_lossy().into_owned(),
        "-f".to_owned(),
        "f32le".to_owned(),
        "-ar".to_owned(),
        SAMPLE_RATE.to_string(),
        "-ac".to_owned(),
        CHANNELS.to_string(),
        "-i".to_owned(),
        audio_path.to_string_lossy().into_owned(),
        "-c:v".to_owned(),
        "libx264".to_owned(),
        "-pix_fmt".to_owned(),
        "yuv420p".to_owned(),
        "-b:v".to_owned(),
        VIDEO_BITRATE.to_owned(),
        "-g".to_owned(),
        "90".to_owned(),
        "-keyint_min".to_owned(),
        "90".to_owned(),
        "-c:a".to_owned(),
        "aac".to_owned(),
        "-b:a".to_owned(),
        AUDIO_BITRATE.to_owned(),
        "-movflags".to_owned(),
        "+faststart".to_owned(),
        output_path.to_string_lossy().into_owned(),
    ]
}

fn run_ffmpeg(ffmpeg_path: &Path, args: &[String]) -> Result<()> {
    let mut child = Command::new(ffmpeg_path)
        .args(args.iter().map(String::as_str))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                anyhow!(
                    "ffmpeg executable not found (resolved_path={}). Install ffmpeg or use the `sidecar_ffmpeg` feature.",
                    ffmpeg_path.display()
                )
            } else {
                anyhow!(
                    "failed to spawn ffmpeg (resolved_path={}): {error}",
                    ffmpeg_path.display()
                )
            }
        })?;

    let mut stderr_pipe = child.stderr.take();
    let status = child.wait().context("failed waiting for ffmpeg process")?;
    let stderr_tail = read_stderr_tail(&mut stderr_pipe)?;
    if !status.success() {
        bail!(
            "ffmpeg failed with status {status} (args='{}', stderr_tail='{}')",
            args.join(" "),
            stderr_tail
        );
    }
    Ok(())
}

/// Planar f32le window bytes back to interleaved stereo f32le, the layout the
/// raw-audio demuxer expects.
fn planar_bytes_to_interleaved(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() % (4 * CHANNELS) != 0 {
        bail!("planar audio payload of {} bytes is not stereo f32", data.len());
    }
    let half = data.len() / 2;
    let (left, right) = data.split_at(half);

    let mut interleaved = Vec::with_capacity(data.len());
    for (l, r) in left.chunks_exact(4).zip(right.chunks_exact(4)) {
        interleaved.extend_from_slice(l);
        interleaved.extend_from_slice(r);
    }
    Ok(interleaved)
}

/// Decode one sound asset to stereo 44.1 kHz f32 PCM through ffmpeg.
pub fn decode_clip_file(ffmpeg_path: &Path, clip_path: &Path) -> Result<DecodedClip> {
    let output = Command::new(ffmpeg_path)
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-i")
        .arg(clip_path)
        .arg("-f")
        .arg("f32le")
        .arg("-acodec")
        .arg("pcm_f32le")
        .arg("-ac")
        .arg(CHANNELS.to_string())
        .arg("-ar")
        .arg(SAMPLE_RATE.to_string())
        .arg("-")
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("failed to run ffmpeg decoder for {}", clip_path.display()))?;

    if !output.status.success() {
        bail!(
            "ffmpeg failed to decode {} (stderr_tail='{}')",
            clip_path.display(),
            last_n_chars(&String::from_utf8_lossy(&output.stderr), 500)
        );
    }

    let mut samples = Vec::with_capacity(output.stdout.len() / 4);
    for bytes in output.stdout.chunks_exact(4) {
        samples.push(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
    }
    Ok(DecodedClip::from_interleaved_stereo(&samples))
}

/// Decodes every audio file in a directory; file stems become sound ids.
pub struct DirClipSource {
    dir: PathBuf,
    mode: FfmpegMode,
}

impl DirClipSource {
    pub fn new(dir: impl Into<PathBuf>, mode: FfmpegMode) -> Self {
        Self {
            dir: dir.into(),
            mode,
        }
    }
}

impl ClipSource for DirClipSource {
    fn decode_all(&mut self) -> Result<ClipTable> {
        let ffmpeg_path = resolve_ffmpeg_path(self.mode)?;
        let mut table = ClipTable::new();

        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read clip directory {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| {
                format!("failed to read clip directory entry in {}", self.dir.display())
            })?;
            let path = entry.path();
            let is_audio = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(str::to_ascii_lowercase)
                .is_some_and(|ext| matches!(ext.as_str(), "wav" | "mp3" | "ogg" | "m4a" | "flac"));
            if !is_audio {
                continue;
            }

            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match decode_clip_file(&ffmpeg_path, &path) {
                Ok(clip) => table.insert(stem, clip),
                // One undecodable asset only silences its own events later.
                Err(error) => warn!("skipping clip {}: {error:#}", path.display()),
            }
        }

        Ok(table)
    }
}

fn read_stderr_tail(stderr: &mut Option<std::process::ChildStderr>) -> Result<String> {
    let Some(mut pipe) = stderr.take() else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)
        .context("failed reading ffmpeg stderr")?;
    let text = String::from_utf8_lossy(&buf).to_string();
    Ok(last_n_chars(&text, 500))
}

fn last_n_chars(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars().collect::<Vec<_>>();
    if chars.len() > max_chars {
        chars = chars[chars.len().saturating_sub(max_chars)..].to_vec();
    }
    chars.into_iter().collect::<String>().trim().to_owned()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{
        container_args, planar_bytes_to_interleaved, RawAudioChunker, RawVideoChunker,
    };
    use crate::codec::{AudioEncoder, Track, VideoEncoder};

    #[test]
    fn video_chunker_is_a_tagged_passthrough() {
        let mut chunker = RawVideoChunker;
        let chunks = chunker
            .encode(vec![9, 9, 9, 9], 1234, 10, true)
            .expect("encode");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].track, Track::Video);
        assert_eq!(chunks[0].timestamp_us, 1234);
        assert!(chunks[0].keyframe);
        assert_eq!(chunks[0].data, vec![9, 9, 9, 9]);
        assert!(chunker.flush().expect("flush").is_empty());
    }

    #[test]
    fn audio_chunker_validates_the_planar_shape() {
        let mut chunker = RawAudioChunker;
        assert!(chunker.encode(&[0.0; 5], 4, 0, 1).is_err());

        let chunks = chunker.encode(&[0.5, -0.5, 1.0, -1.0], 2, 7, 1).expect("encode");
        assert_eq!(chunks[0].track, Track::Audio);
        assert_eq!(chunks[0].data.len(), 16);
    }

    #[test]
    fn planar_payload_interleaves_back_to_stereo() {
        // L = [1.0, 2.0], R = [3.0, 4.0]
        let mut planar = Vec::new();
        for v in [1.0f32, 2.0, 3.0, 4.0] {
            planar.extend_from_slice(&v.to_le_bytes());
        }
        let interleaved = planar_bytes_to_interleaved(&planar).expect("interleave");

        let sample = |i: usize| {
            f32::from_le_bytes([
                interleaved[i * 4],
                interleaved[i * 4 + 1],
                interleaved[i * 4 + 2],
                interleaved[i * 4 + 3],
            ])
        };
        assert_eq!(sample(0), 1.0);
        assert_eq!(sample(1), 3.0);
        assert_eq!(sample(2), 2.0);
        assert_eq!(sample(3), 4.0);

        assert!(planar_bytes_to_interleaved(&[0; 12]).is_err());
    }

    #[test]
    fn container_args_pin_the_output_target() {
        let args = container_args(
            Path::new("/tmp/v.raw"),
            Path::new("/tmp/a.raw"),
            Path::new("/tmp/out.mp4"),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-s:v 432x304"));
        assert!(joined.contains("-r 30"));
        assert!(joined.contains("-ar 44100"));
        assert!(joined.contains("-g 90"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-c:a aac"));
        assert!(args.last().is_some_and(|a| a.ends_with("out.mp4")));
    }
}

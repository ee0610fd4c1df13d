//! Fixed output target and the codec/container service seam.
//!
//! The low-level encoders and the container writer are external services; the
//! pipelines talk to them through the traits below and only deal in
//! timestamped [`EncodedChunk`]s.

use anyhow::Result;

pub const FRAME_WIDTH: u32 = 432;
pub const FRAME_HEIGHT: u32 = 304;
pub const FRAME_RATE: u32 = 30;
pub const SAMPLE_RATE: u32 = 44_100;
pub const CHANNELS: usize = 2;

/// Every 90th frame (0-indexed) is encoded self-contained.
pub const KEYFRAME_INTERVAL: u32 = 90;
/// Upper bound on video encode requests submitted but not yet completed.
pub const VIDEO_IN_FLIGHT_LIMIT: usize = 20;
/// Samples per channel in one audio encode window.
pub const AUDIO_WINDOW_SAMPLES: usize = 4096;

const MICROS_PER_SECOND: u64 = 1_000_000;

/// Presentation timestamp of a video frame, in microseconds.
pub fn video_timestamp_us(tick: u32) -> u64 {
    u64::from(tick) * MICROS_PER_SECOND / u64::from(FRAME_RATE)
}

/// Presentation timestamp of an audio window starting at `sample`, in
/// microseconds.
pub fn audio_timestamp_us(sample: usize) -> u64 {
    sample as u64 * MICROS_PER_SECOND / u64::from(SAMPLE_RATE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    Video,
    Audio,
}

/// Opaque encoder output. Video and audio chunks are produced independently
/// and ordered purely by timestamp when multiplexed.
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub track: Track,
    pub timestamp_us: u64,
    pub duration_us: u64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

/// Chunk metadata retained by the multiplexer; payloads are streamed to the
/// container writer as they arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
    pub track: Track,
    pub timestamp_us: u64,
    pub duration_us: u64,
    pub keyframe: bool,
    pub size: usize,
}

impl ChunkMeta {
    pub fn of(chunk: &EncodedChunk) -> Self {
        Self {
            track: chunk.track,
            timestamp_us: chunk.timestamp_us,
            duration_us: chunk.duration_us,
            keyframe: chunk.keyframe,
            size: chunk.data.len(),
        }
    }
}

/// Video encoder service. `encode` may return zero or more chunks (encoders
/// are allowed to buffer); `flush` drains whatever is still pending.
/// Any error is fatal for the conversion job.
pub trait VideoEncoder: Send {
    fn encode(
        &mut self,
        rgba: Vec<u8>,
        timestamp_us: u64,
        duration_us: u64,
        keyframe: bool,
    ) -> Result<Vec<EncodedChunk>>;

    fn flush(&mut self) -> Result<Vec<EncodedChunk>>;
}

/// Audio encoder service. Windows arrive in planar layout: all of channel 0's
/// samples for the window, then all of channel 1's.
pub trait AudioEncoder {
    fn encode(
        &mut self,
        planar: &[f32],
        samples_per_channel: usize,
        timestamp_us: u64,
        duration_us: u64,
    ) -> Result<Vec<EncodedChunk>>;

    fn flush(&mut self) -> Result<Vec<EncodedChunk>>;
}

/// Container writer service. Receives chunk payloads as the multiplexer
/// accepts them and produces the finished container bytes once, at the end.
pub trait ContainerWriter: Send {
    fn write(&mut self, chunk: &EncodedChunk) -> Result<()>;

    /// `schedule` is the full chunk sequence interleaved by timestamp.
    fn finish(&mut self, schedule: &[ChunkMeta]) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::{audio_timestamp_us, video_timestamp_us};

    #[test]
    fn video_timestamps_strictly_increase() {
        let mut previous = None;
        for tick in 0..300 {
            let ts = video_timestamp_us(tick);
            assert_eq!(ts, u64::from(tick) * 1_000_000 / 30);
            if let Some(p) = previous {
                assert!(ts > p, "timestamp must grow at tick {tick}");
            }
            previous = Some(ts);
        }
    }

    #[test]
    fn adjacent_video_timestamps_cover_a_frame() {
        // 33333/33334 us alternation sums to exact seconds.
        assert_eq!(video_timestamp_us(30), 1_000_000);
        assert_eq!(video_timestamp_us(90), 3_000_000);
    }

    #[test]
    fn audio_timestamp_matches_sample_clock() {
        assert_eq!(audio_timestamp_us(0), 0);
        assert_eq!(audio_timestamp_us(44_100), 1_000_000);
        assert_eq!(audio_timestamp_us(4096), 4096 * 1_000_000 / 44_100);
    }
}

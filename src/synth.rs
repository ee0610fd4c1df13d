//! Offline audio resynthesis.
//!
//! The sound-event log plus the decoded clip table are rendered into one
//! continuous stereo PCM timeline spanning the whole replay, each clip mixed
//! additively at its scheduled tick with equal-power panning applied. Values
//! are deliberately not clamped here; the encoder side owns clipping.

use std::collections::HashMap;

use log::warn;

use crate::codec::{FRAME_RATE, SAMPLE_RATE};
use crate::recorder::SoundEvent;

/// Pan values are attenuated before the pan law so even a hard-panned
/// trigger keeps some energy in both ears.
pub const PAN_ATTENUATION: f32 = 0.75;

/// Samples per tick: 44_100 / 30.
const SAMPLES_PER_TICK: usize = (SAMPLE_RATE / FRAME_RATE) as usize;

/// Pre-decoded PCM for one sound asset: mono or stereo, 44.1 kHz.
#[derive(Debug, Clone)]
pub struct DecodedClip {
    channels: Vec<Vec<f32>>,
}

impl DecodedClip {
    pub fn mono(samples: Vec<f32>) -> Self {
        Self {
            channels: vec![samples],
        }
    }

    pub fn stereo(left: Vec<f32>, right: Vec<f32>) -> Self {
        let len = left.len().min(right.len());
        let mut left = left;
        let mut right = right;
        left.truncate(len);
        right.truncate(len);
        Self {
            channels: vec![left, right],
        }
    }

    pub fn from_interleaved_stereo(samples: &[f32]) -> Self {
        let mut left = Vec::with_capacity(samples.len() / 2);
        let mut right = Vec::with_capacity(samples.len() / 2);
        for pair in samples.chunks_exact(2) {
            left.push(pair[0]);
            right.push(pair[1]);
        }
        Self::stereo(left, right)
    }

    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stereo(&self) -> bool {
        self.channels.len() >= 2
    }
}

/// Decoded clips keyed by lowercased sound id. Loaded once before the replay
/// starts; read-only afterwards.
#[derive(Debug, Default)]
pub struct ClipTable {
    clips: HashMap<String, DecodedClip>,
}

impl ClipTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, sound_id: &str, clip: DecodedClip) {
        self.clips.insert(sound_id.to_ascii_lowercase(), clip);
    }

    pub fn get(&self, sound_id: &str) -> Option<&DecodedClip> {
        self.clips.get(&sound_id.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.clips.keys().map(String::as_str)
    }
}

/// Source of decoded clips; the orchestrator drains it completely before the
/// replay starts.
pub trait ClipSource {
    fn decode_all(&mut self) -> anyhow::Result<ClipTable>;
}

/// A pre-built table, for embedders that decode their own assets (and for
/// tests).
pub struct StaticClips(pub ClipTable);

impl ClipSource for StaticClips {
    fn decode_all(&mut self) -> anyhow::Result<ClipTable> {
        Ok(std::mem::take(&mut self.0))
    }
}

/// The rendered stereo timeline, one buffer per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoTimeline {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl StereoTimeline {
    fn silent(len: usize) -> Self {
        Self {
            left: vec![0.0; len],
            right: vec![0.0; len],
        }
    }

    pub fn len(&self) -> usize {
        self.left.len()
    }

    pub fn is_empty(&self) -> bool {
        self.left.is_empty()
    }

    /// Interleaved f32le bytes, for the raw debug dump.
    pub fn to_f32le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len() * 2 * 4);
        for i in 0..self.len() {
            bytes.extend_from_slice(&self.left[i].to_le_bytes());
            bytes.extend_from_slice(&self.right[i].to_le_bytes());
        }
        bytes
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub mixed_events: usize,
    /// Events whose sound id had no decoded clip. Should be zero in a
    /// correct build; never aborts the render.
    pub skipped_events: usize,
}

/// Timeline length for a replay of `total_ticks`: the full duration plus one
/// second of tail padding so trailing clips are not truncated.
pub fn timeline_len(total_ticks: u32) -> usize {
    let duration_samples = (total_ticks as usize) * SAMPLES_PER_TICK;
    duration_samples + SAMPLE_RATE as usize
}

/// Render the whole timeline. Events are mixed in a canonical order so the
/// result is bit-identical under any permutation of the log.
pub fn render_timeline(
    events: &[SoundEvent],
    clips: &ClipTable,
    total_ticks: u32,
) -> (StereoTimeline, RenderStats) {
    let mut timeline = StereoTimeline::silent(timeline_len(total_ticks));
    let mut stats = RenderStats::default();

    let mut ordered: Vec<&SoundEvent> = events.iter().collect();
    ordered.sort_by(|a, b| {
        (a.frame_index, a.sound_id.as_str(), a.pan.to_bits())
            .cmp(&(b.frame_index, b.sound_id.as_str(), b.pan.to_bits()))
    });

    for event in ordered {
        let Some(clip) = clips.get(&event.sound_id) else {
            stats.skipped_events += 1;
            if stats.skipped_events <= 5 {
                warn!(
                    "no decoded clip for sound id \"{}\" (frame {}); event skipped",
                    event.sound_id, event.frame_index
                );
            }
            continue;
        };

        let start = event.frame_index as usize * SAMPLES_PER_TICK;
        mix_clip(&mut timeline, clip, start, event.pan * PAN_ATTENUATION);
        stats.mixed_events += 1;
    }

    if stats.skipped_events > 0 {
        warn!(
            "{} of {} sound events had no decoded clip and were skipped",
            stats.skipped_events,
            events.len()
        );
    }

    (timeline, stats)
}

/// Equal-power pan gains for a mono source: `pan` in [-1, 1] maps to a
/// quarter circle, so energy stays constant across the field.
pub(crate) fn mono_pan_gains(pan: f32) -> (f32, f32) {
    let x = (pan.clamp(-1.0, 1.0) + 1.0) / 2.0 * std::f32::consts::FRAC_PI_2;
    (x.cos(), x.sin())
}

fn mix_clip(timeline: &mut StereoTimeline, clip: &DecodedClip, start: usize, pan: f32) {
    let len = timeline.len();
    if start >= len || clip.is_empty() {
        return;
    }
    let span = clip.len().min(len - start);

    if clip.is_stereo() {
        // Stereo sources cross-feed the far channel instead of re-imaging.
        let pan = pan.clamp(-1.0, 1.0);
        let x = if pan <= 0.0 { pan + 1.0 } else { pan } * std::f32::consts::FRAC_PI_2;
        let (gain_l, gain_r) = (x.cos(), x.sin());
        let (left_in, right_in) = (&clip.channels[0], &clip.channels[1]);
        if pan <= 0.0 {
            for i in 0..span {
                timeline.left[start + i] += left_in[i] + right_in[i] * gain_l;
                timeline.right[start + i] += right_in[i] * gain_r;
            }
        } else {
            for i in 0..span {
                timeline.left[start + i] += left_in[i] * gain_l;
                timeline.right[start + i] += right_in[i] + left_in[i] * gain_r;
            }
        }
    } else {
        let (gain_l, gain_r) = mono_pan_gains(pan);
        let samples = &clip.channels[0];
        for i in 0..span {
            timeline.left[start + i] += samples[i] * gain_l;
            timeline.right[start + i] += samples[i] * gain_r;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        mono_pan_gains, render_timeline, timeline_len, ClipTable, DecodedClip, StereoTimeline,
    };
    use crate::recorder::SoundEvent;

    fn event(sound_id: &str, frame_index: u32, pan: f32) -> SoundEvent {
        SoundEvent {
            sound_id: sound_id.to_owned(),
            frame_index,
            pan,
        }
    }

    fn table_with(entries: &[(&str, DecodedClip)]) -> ClipTable {
        let mut table = ClipTable::new();
        for (id, clip) in entries {
            table.insert(id, clip.clone());
        }
        table
    }

    #[test]
    fn timeline_length_is_duration_plus_one_second() {
        assert_eq!(timeline_len(0), 44_100);
        assert_eq!(timeline_len(30), 44_100 * 2);
        assert_eq!(timeline_len(300), 44_100 * 11);
    }

    #[test]
    fn output_length_is_independent_of_events() {
        let clips = table_with(&[("pi", DecodedClip::mono(vec![0.5; 100]))]);
        let empty = render_timeline(&[], &clips, 300).0;
        let busy = render_timeline(
            &[event("pi", 0, 0.0), event("pi", 100, 0.3), event("pi", 299, -1.0)],
            &clips,
            300,
        )
        .0;
        assert_eq!(empty.len(), timeline_len(300));
        assert_eq!(busy.len(), empty.len());
    }

    #[test]
    fn missing_clip_yields_silence_and_a_skip_count() {
        let clips = ClipTable::new();
        let (timeline, stats) = render_timeline(&[event("ghost", 10, 0.0)], &clips, 60);

        assert_eq!(stats.skipped_events, 1);
        assert_eq!(stats.mixed_events, 0);
        assert_eq!(timeline.len(), timeline_len(60));
        assert!(timeline.left.iter().all(|s| *s == 0.0));
        assert!(timeline.right.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn mixing_is_permutation_independent() {
        let clips = table_with(&[
            ("pi", DecodedClip::mono(vec![0.3; 2000])),
            ("ka", DecodedClip::mono(vec![-0.2; 1500])),
            ("chu", DecodedClip::stereo(vec![0.1; 800], vec![0.4; 800])),
        ]);
        let forward = [
            event("pi", 0, 0.0),
            event("ka", 0, -0.6),
            event("chu", 1, 0.9),
            event("pi", 1, 0.2),
        ];
        let mut reversed = forward.to_vec();
        reversed.reverse();
        let mut rotated = forward.to_vec();
        rotated.rotate_left(2);

        let a = render_timeline(&forward, &clips, 30).0;
        let b = render_timeline(&reversed, &clips, 30).0;
        let c = render_timeline(&rotated, &clips, 30).0;
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn centre_pan_splits_a_mono_clip_equally() {
        let (l, r) = mono_pan_gains(0.0);
        assert!((l - r).abs() < 1e-6);
        assert!((l - std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-6);
    }

    #[test]
    fn pan_attenuation_keeps_both_channels_alive() {
        // A hard-left trigger arrives as pan -1.0, attenuated to -0.75.
        let clips = table_with(&[("pi", DecodedClip::mono(vec![1.0; 10]))]);
        let (timeline, _) = render_timeline(&[event("pi", 0, -1.0)], &clips, 1);
        assert!(timeline.left[0] > 0.9);
        assert!(timeline.right[0] > 0.0, "attenuated pan never fully mutes");
        assert!(timeline.right[0] < timeline.left[0]);
    }

    #[test]
    fn overlapping_events_superpose_without_clamping() {
        let clips = table_with(&[("pi", DecodedClip::mono(vec![0.9; 10]))]);
        let (timeline, _) = render_timeline(
            &[event("pi", 0, 0.0), event("pi", 0, 0.0)],
            &clips,
            1,
        );
        // 2 * 0.9 * cos(pi/4) > 1.0; the engine must not pre-clamp.
        assert!(timeline.left[0] > 1.0);
    }

    #[test]
    fn trailing_clip_fits_in_the_tail_padding() {
        let clips = table_with(&[("tail", DecodedClip::mono(vec![0.5; 44_100]))]);
        let (timeline, stats) = render_timeline(&[event("tail", 29, 0.0)], &clips, 30);

        assert_eq!(stats.mixed_events, 1);
        let start = 29 * 1470;
        assert!(timeline.left[start + 44_099] != 0.0, "clip tail preserved");
    }

    #[test]
    fn raw_debug_bytes_interleave_the_channels() {
        let timeline = StereoTimeline {
            left: vec![1.0, 2.0],
            right: vec![-1.0, -2.0],
        };
        let bytes = timeline.to_f32le_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 1.0);
        assert_eq!(f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), -1.0);
        assert_eq!(f32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 2.0);
    }
}

//! Audio encode pipeline.
//!
//! Slices the rendered timeline into fixed windows, repacks each window into
//! the planar layout the encoder expects, and submits in strict sample order.
//! Audio encoding is cheap next to video, so there is no in-flight throttle;
//! the pipeline simply drives the encoder to completion and flushes.

use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::codec::{audio_timestamp_us, AudioEncoder, AUDIO_WINDOW_SAMPLES};
use crate::convert::CancelToken;
use crate::mux::ChunkMux;
use crate::synth::StereoTimeline;

/// Encode the whole timeline. Returns the number of windows submitted.
pub fn encode_timeline(
    timeline: &StereoTimeline,
    encoder: &mut dyn AudioEncoder,
    mux: &Mutex<ChunkMux>,
    cancel: &CancelToken,
) -> Result<usize> {
    let total = timeline.len();
    let mut windows = 0;

    let mut start = 0;
    while start < total {
        cancel.check()?;

        let size = AUDIO_WINDOW_SAMPLES.min(total - start);
        let planar = planar_window(timeline, start, size);
        let timestamp_us = audio_timestamp_us(start);
        let duration_us = audio_timestamp_us(start + size) - timestamp_us;

        let chunks = encoder.encode(&planar, size, timestamp_us, duration_us)?;
        let mut mux = mux.lock().map_err(|_| anyhow!("muxer lock poisoned"))?;
        for chunk in chunks {
            mux.add(chunk)?;
        }
        drop(mux);

        windows += 1;
        start += size;
    }

    let chunks = encoder.flush()?;
    let mut mux = mux.lock().map_err(|_| anyhow!("muxer lock poisoned"))?;
    for chunk in chunks {
        mux.add(chunk)?;
    }

    Ok(windows)
}

/// Planar layout: all of channel 0's samples for the window, then all of
/// channel 1's.
fn planar_window(timeline: &StereoTimeline, start: usize, size: usize) -> Vec<f32> {
    let mut planar = Vec::with_capacity(size * 2);
    planar.extend_from_slice(&timeline.left[start..start + size]);
    planar.extend_from_slice(&timeline.right[start..start + size]);
    planar
}

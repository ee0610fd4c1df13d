//! Interface to the deterministic game simulation.
//!
//! The simulation itself lives in the embedding application; the transcoder
//! only needs to step it one tick at a time, read back a raster frame, and
//! intercept its sound triggers.

use anyhow::{bail, Result};

use crate::codec::{FRAME_HEIGHT, FRAME_WIDTH};

/// One rendered frame, RGBA8, tightly packed rows.
#[derive(Debug, Clone)]
pub struct RasterFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RasterFrame {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; (width * height * 4) as usize],
        }
    }

    pub fn expected_len(&self) -> usize {
        (self.width * self.height * 4) as usize
    }

    /// The pipeline only handles the fixed output target.
    pub fn validate(&self) -> Result<()> {
        if self.width != FRAME_WIDTH || self.height != FRAME_HEIGHT {
            bail!(
                "unexpected frame size {}x{}, expected {}x{}",
                self.width,
                self.height,
                FRAME_WIDTH,
                FRAME_HEIGHT
            );
        }
        if self.data.len() != self.expected_len() {
            bail!(
                "frame buffer holds {} bytes, expected {}",
                self.data.len(),
                self.expected_len()
            );
        }
        Ok(())
    }
}

/// Sound-trigger interception point: `(sound id, stereo pan in [-1, 1])`.
/// Installed once; must never fail or touch simulation state.
pub type SoundHook = Box<dyn FnMut(&str, f32)>;

/// The deterministic replay engine, driven one tick per output frame.
pub trait Simulation {
    /// Advance one tick using the replay's recorded input for that tick.
    fn advance_tick(&mut self) -> Result<()>;

    /// Rasterize the current scene graph.
    fn render_frame(&mut self) -> Result<RasterFrame>;

    /// Replace the simulation's sound output with `hook`.
    fn install_sound_hook(&mut self, hook: SoundHook);

    /// Current tick counter (ticks completed since the start of the replay).
    fn tick(&self) -> u32;
}

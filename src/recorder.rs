//! Sound-trigger capture.
//!
//! During replay the simulation keeps requesting audio playback; instead of
//! producing sound, the installed hook appends `(sound id, tick, pan)` to an
//! append-only log that the resynthesis engine replays afterwards. The hook
//! must never block, never fail, and never touch simulation state.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::sim::SoundHook;

/// The looping background music channel is excluded from capture; the
/// output keeps sound effects only.
pub const BGM_SOUND_ID: &str = "bgm";

#[derive(Debug, Clone, PartialEq)]
pub struct SoundEvent {
    /// Lowercased sound identifier, matching the clip table keys.
    pub sound_id: String,
    /// Tick on which the trigger fired.
    pub frame_index: u32,
    /// Stereo pan in [-1, 1].
    pub pan: f32,
}

#[derive(Default)]
struct RecorderInner {
    current_frame: Cell<u32>,
    events: RefCell<Vec<SoundEvent>>,
}

/// Records every sound trigger fired while the orchestrator steps the
/// simulation. The orchestrator stamps the tick before each step; the hook
/// reads it when a trigger fires.
#[derive(Default)]
pub struct SoundRecorder {
    inner: Rc<RecorderInner>,
}

impl SoundRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current_frame(&self, frame: u32) {
        self.inner.current_frame.set(frame);
    }

    /// Build the hook to hand to [`crate::sim::Simulation::install_sound_hook`].
    /// Infallible by construction: a trigger for an unknown id still records
    /// (resynthesis skips it later), bgm is dropped, pan is clamped.
    pub fn hook(&self) -> SoundHook {
        let inner = Rc::clone(&self.inner);
        Box::new(move |sound_id, pan| {
            if sound_id.eq_ignore_ascii_case(BGM_SOUND_ID) {
                return;
            }
            inner.events.borrow_mut().push(SoundEvent {
                sound_id: sound_id.to_ascii_lowercase(),
                frame_index: inner.current_frame.get(),
                pan: pan.clamp(-1.0, 1.0),
            });
        })
    }

    pub fn len(&self) -> usize {
        self.inner.events.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the recorder, yielding the ordered event log.
    pub fn into_events(self) -> Vec<SoundEvent> {
        self.inner.events.take()
    }
}

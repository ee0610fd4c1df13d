//! Conversion orchestrator.
//!
//! Drives one replay through the whole pipeline: load, decode clips, tick the
//! simulation while capturing sound triggers and encoding composited frames,
//! resynthesize and encode the audio track, finalize the container, write the
//! named output file. Strictly sequential and single-flight; one failed phase
//! moves the job to `Failed` and drops every resource it allocated.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDateTime;
use log::{debug, info, warn};
use regex::Regex;

use crate::audio_pipeline::encode_timeline;
use crate::bubbles::{BubbleAnimator, ChatBubble};
use crate::codec::{AudioEncoder, ContainerWriter, VideoEncoder, FRAME_RATE};
use crate::compositor::{Compositor, OverlayText};
use crate::mux::ChunkMux;
use crate::recorder::SoundRecorder;
use crate::replay::{load_replay_file, ReplayPack};
use crate::sim::Simulation;
use crate::synth::{render_timeline, ClipSource};
use crate::video_pipeline::VideoPipeline;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Loading,
    Decoding,
    Rendering,
    Synthesizing,
    Muxing,
    Saved,
    Failed,
}

/// Cooperative cancellation, checked at every suspension point.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            bail!("conversion cancelled");
        }
        Ok(())
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// The encoder and container services for one job. The production set comes
/// from [`crate::ffmpeg::services`]; tests supply in-memory doubles.
pub struct CodecServices {
    pub video: Box<dyn VideoEncoder>,
    pub audio: Box<dyn AudioEncoder>,
    pub writer: Box<dyn ContainerWriter>,
}

#[derive(Debug, Clone)]
pub struct ConvertOptions {
    pub output_dir: PathBuf,
    pub show_nicknames: bool,
    pub show_addresses: bool,
    /// Failed simulation ticks are skipped and counted; set a limit to abort
    /// instead once too many go quietly wrong.
    pub max_skipped_ticks: Option<u32>,
    /// Also write the rendered timeline as raw interleaved f32le.
    pub raw_audio_debug: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            show_nicknames: true,
            show_addresses: true,
            max_skipped_ticks: None,
            raw_audio_debug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    pub state: JobState,
    pub percent: f32,
}

#[derive(Debug)]
pub struct ConvertOutput {
    pub path: PathBuf,
    pub bytes_written: usize,
    pub skipped_ticks: u32,
    pub skipped_sound_events: usize,
    pub duration_seconds: f64,
}

/// Builds the simulation collaborator for a loaded pack.
pub type SimFactory<'a> = dyn FnMut(&ReplayPack) -> Result<Box<dyn Simulation>> + 'a;

pub struct Converter {
    state: JobState,
    cancel: CancelToken,
}

impl Converter {
    pub fn new() -> Self {
        Self {
            state: JobState::Idle,
            cancel: CancelToken::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Handle for cancelling the running job from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn run(
        &mut self,
        replay_path: &Path,
        sim_factory: &mut SimFactory<'_>,
        clip_source: &mut dyn ClipSource,
        services: CodecServices,
        compositor: Option<&mut Compositor>,
        options: &ConvertOptions,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<ConvertOutput> {
        if !matches!(
            self.state,
            JobState::Idle | JobState::Saved | JobState::Failed
        ) {
            bail!("a conversion job is already in flight");
        }
        self.cancel.reset();

        match self.run_inner(
            replay_path,
            sim_factory,
            clip_source,
            services,
            compositor,
            options,
            progress,
        ) {
            Ok(output) => {
                self.state = JobState::Saved;
                progress(Progress {
                    state: JobState::Saved,
                    percent: 100.0,
                });
                Ok(output)
            }
            Err(error) => {
                self.state = JobState::Failed;
                Err(error)
            }
        }
    }

    fn run_inner(
        &mut self,
        replay_path: &Path,
        sim_factory: &mut SimFactory<'_>,
        clip_source: &mut dyn ClipSource,
        services: CodecServices,
        mut compositor: Option<&mut Compositor>,
        options: &ConvertOptions,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<ConvertOutput> {
        let CodecServices {
            video,
            mut audio,
            writer,
        } = services;

        self.enter(JobState::Loading, progress);
        self.cancel.check()?;
        let pack = load_replay_file(replay_path)?;
        let total_ticks = pack.total_ticks();
        info!(
            "converting replay {} ({} ticks, {:.2}s)",
            replay_path.display(),
            total_ticks,
            f64::from(total_ticks) / f64::from(FRAME_RATE)
        );

        // All clips must be decoded before the first tick runs.
        self.enter(JobState::Decoding, progress);
        self.cancel.check()?;
        let clips = clip_source.decode_all()?;
        if clips.is_empty() {
            warn!("clip table is empty; the audio track will be silent");
        }

        let mut sim = sim_factory(&pack)?;
        let recorder = SoundRecorder::new();
        sim.install_sound_hook(recorder.hook());
        let mut animator = BubbleAnimator::new(&pack.room_id, &pack.chats);
        let overlay = OverlayText::from_pack(&pack, options.show_nicknames, options.show_addresses);
        if compositor.is_none() {
            warn!("no compositor supplied; overlays will not be burned in");
        }

        self.enter(JobState::Rendering, progress);
        let mux = Arc::new(Mutex::new(ChunkMux::new(writer)));
        let mut pipeline = VideoPipeline::spawn(video, Arc::clone(&mux))?;

        let mut skipped_ticks: u32 = 0;
        for tick in 0..total_ticks {
            self.cancel.check()?;
            recorder.set_current_frame(tick);

            // A single corrupted tick must not abort an hour-long render.
            if let Err(error) = sim.advance_tick() {
                skipped_ticks += 1;
                if skipped_ticks % 1000 == 1 {
                    warn!("tick {tick} failed and was skipped: {error:#}");
                }
                if let Some(limit) = options.max_skipped_ticks {
                    if skipped_ticks > limit {
                        bail!("{skipped_ticks} simulation ticks failed; aborting");
                    }
                }
            }
            animator.advance(tick);

            let mut frame = sim.render_frame()?;
            if let Some(compositor) = compositor.as_deref_mut() {
                let bubbles: Vec<&ChatBubble> = animator.bubbles().collect();
                compositor.composite(&mut frame, &overlay, &bubbles)?;
            }
            pipeline.submit_frame(tick, frame)?;

            if tick % FRAME_RATE == 0 {
                progress(Progress {
                    state: JobState::Rendering,
                    percent: tick as f32 / total_ticks as f32 * 100.0,
                });
            }
        }
        // Video must be fully flushed before the audio log is read: the log
        // is not final until the simulation has finished all ticks.
        pipeline.finish()?;
        if skipped_ticks > 0 {
            warn!("{skipped_ticks} of {total_ticks} ticks failed and were skipped");
        }

        self.enter(JobState::Synthesizing, progress);
        self.cancel.check()?;
        let events = recorder.into_events();
        debug!("captured {} sound events", events.len());
        let (timeline, stats) = render_timeline(&events, &clips, total_ticks);
        encode_timeline(&timeline, audio.as_mut(), &mux, &self.cancel)?;

        self.enter(JobState::Muxing, progress);
        self.cancel.check()?;
        let bytes = {
            let mut mux = mux.lock().map_err(|_| anyhow!("muxer lock poisoned"))?;
            let (video_chunks, audio_chunks) = mux.chunk_counts();
            debug!("finalizing container: {video_chunks} video + {audio_chunks} audio chunks");
            mux.finalize()?
        };

        let file_name = output_file_name(chrono::Local::now().naive_local(), &pack.nicknames);
        let path = options.output_dir.join(&file_name);
        std::fs::write(&path, &bytes)
            .with_context(|| format!("failed to write output file {}", path.display()))?;
        if options.raw_audio_debug {
            let debug_path = path.with_extension("f32le");
            std::fs::write(&debug_path, timeline.to_f32le_bytes()).with_context(|| {
                format!("failed to write raw audio dump {}", debug_path.display())
            })?;
        }
        info!("wrote {} ({} bytes)", path.display(), bytes.len());

        Ok(ConvertOutput {
            path,
            bytes_written: bytes.len(),
            skipped_ticks,
            skipped_sound_events: stats.skipped_events,
            duration_seconds: f64::from(total_ticks) / f64::from(FRAME_RATE),
        })
    }

    fn enter(&mut self, state: JobState, progress: &mut dyn FnMut(Progress)) {
        self.state = state;
        progress(Progress {
            state,
            percent: 0.0,
        });
    }
}

/// Deterministic output name: date-time stamp, plus both nicknames when
/// present, stripped of characters that are illegal in file names.
pub fn output_file_name(now: NaiveDateTime, nicknames: &[String; 2]) -> String {
    let stamp = now.format("%Y%m%d_%H%M");
    if !nicknames[0].is_empty() && !nicknames[1].is_empty() {
        format!(
            "{stamp}_{}_vs_{}.mp4",
            sanitize_for_filename(&nicknames[0]),
            sanitize_for_filename(&nicknames[1])
        )
    } else {
        format!("{stamp}_replay.mp4")
    }
}

fn sanitize_for_filename(name: &str) -> String {
    static ILLEGAL: OnceLock<Regex> = OnceLock::new();
    let illegal = ILLEGAL.get_or_init(|| {
        Regex::new(r#"[/\\?%*:|"<>]"#).expect("hardcoded pattern is valid")
    });
    illegal.replace_all(name, "_").into_owned()
}

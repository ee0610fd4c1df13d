//! Offline replay-to-video transcoding.
//!
//! A recorded replay drives the deterministic game simulation at
//! non-real-time speed; sound triggers are captured into an event log, chat
//! bubbles and the nickname header are burned into every rendered frame, and
//! the frames feed a backpressured video encode pipeline. Once the last tick
//! has run, the event log is resynthesized into one stereo PCM timeline,
//! encoded in fixed windows, and both encoded streams are multiplexed into a
//! single MP4.
//!
//! The game simulation, the low-level codecs, and the container writer are
//! external collaborators; see [`sim::Simulation`] and the traits in
//! [`codec`]. A production codec/container service backed by an external
//! ffmpeg process lives in [`ffmpeg`].

pub mod audio_pipeline;
pub mod bubbles;
pub mod codec;
pub mod compositor;
pub mod convert;
pub mod ffmpeg;
pub mod mux;
pub mod recorder;
pub mod replay;
pub mod sim;
pub mod synth;
pub mod video_pipeline;

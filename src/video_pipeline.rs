//! Video encode pipeline.
//!
//! Frames arrive strictly in tick order; each one gets its presentation
//! timestamp and keyframe flag here and is handed to a worker thread that
//! owns the encoder service. The channel between producer and worker is
//! bounded so that queued frames plus the one inside the worker never exceed
//! [`VIDEO_IN_FLIGHT_LIMIT`] — submission blocks instead of polling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};

use crate::codec::{video_timestamp_us, VideoEncoder, KEYFRAME_INTERVAL, VIDEO_IN_FLIGHT_LIMIT};
use crate::mux::ChunkMux;
use crate::sim::RasterFrame;

struct FrameSubmission {
    rgba: Vec<u8>,
    timestamp_us: u64,
    duration_us: u64,
    keyframe: bool,
}

pub struct VideoPipeline {
    sender: Option<mpsc::SyncSender<FrameSubmission>>,
    worker: Option<JoinHandle<Result<()>>>,
    in_flight: Arc<AtomicUsize>,
    next_tick: u32,
}

impl VideoPipeline {
    pub fn spawn(encoder: Box<dyn VideoEncoder>, mux: Arc<Mutex<ChunkMux>>) -> Result<Self> {
        // One submission rides in the worker while the queue holds the rest.
        let (sender, receiver) = mpsc::sync_channel::<FrameSubmission>(VIDEO_IN_FLIGHT_LIMIT - 1);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let worker_in_flight = Arc::clone(&in_flight);
        let worker = thread::Builder::new()
            .name("replaycast-video-encoder".to_owned())
            .spawn(move || run_worker(encoder, mux, receiver, worker_in_flight))
            .context("failed to spawn video encoder thread")?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            in_flight,
            next_tick: 0,
        })
    }

    /// Submit the composited frame for `tick`. Ticks must arrive in order
    /// from zero. Blocks while the encoder is at its in-flight limit.
    pub fn submit_frame(&mut self, tick: u32, frame: RasterFrame) -> Result<()> {
        if tick != self.next_tick {
            bail!(
                "frames must be submitted in tick order: got {}, expected {}",
                tick,
                self.next_tick
            );
        }
        frame.validate()?;

        let timestamp_us = video_timestamp_us(tick);
        let submission = FrameSubmission {
            rgba: frame.data,
            timestamp_us,
            duration_us: video_timestamp_us(tick + 1) - timestamp_us,
            keyframe: tick % KEYFRAME_INTERVAL == 0,
        };

        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("video pipeline has already been finished"))?;
        sender
            .send(submission)
            .map_err(|_| anyhow!("video encoder worker is gone; frame {tick} not encoded"))?;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.next_tick = tick + 1;
        Ok(())
    }

    /// Encode requests submitted but not yet completed.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn frames_submitted(&self) -> u32 {
        self.next_tick
    }

    /// Close the queue, flush the encoder, and wait for all outstanding work.
    pub fn finish(mut self) -> Result<()> {
        drop(self.sender.take());

        let handle = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("video encoder thread missing"))?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow!("video encoder thread panicked")),
        }
    }
}

fn run_worker(
    mut encoder: Box<dyn VideoEncoder>,
    mux: Arc<Mutex<ChunkMux>>,
    receiver: mpsc::Receiver<FrameSubmission>,
    in_flight: Arc<AtomicUsize>,
) -> Result<()> {
    while let Ok(submission) = receiver.recv() {
        let chunks = encoder.encode(
            submission.rgba,
            submission.timestamp_us,
            submission.duration_us,
            submission.keyframe,
        )?;
        let mut mux = mux.lock().map_err(|_| anyhow!("muxer lock poisoned"))?;
        for chunk in chunks {
            mux.add(chunk)?;
        }
        drop(mux);
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    let chunks = encoder.flush()?;
    let mut mux = mux.lock().map_err(|_| anyhow!("muxer lock poisoned"))?;
    for chunk in chunks {
        mux.add(chunk)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::VideoPipeline;
    use crate::codec::{
        ChunkMeta, ContainerWriter, EncodedChunk, Track, VideoEncoder, FRAME_HEIGHT, FRAME_WIDTH,
        VIDEO_IN_FLIGHT_LIMIT,
    };
    use crate::mux::ChunkMux;
    use crate::sim::RasterFrame;
    use anyhow::Result;

    struct NullWriter;

    impl ContainerWriter for NullWriter {
        fn write(&mut self, _chunk: &EncodedChunk) -> Result<()> {
            Ok(())
        }

        fn finish(&mut self, _schedule: &[ChunkMeta]) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    struct ProbeEncoder {
        delay: Duration,
        seen: Arc<Mutex<Vec<(u64, bool)>>>,
        flushed: Arc<AtomicUsize>,
    }

    impl VideoEncoder for ProbeEncoder {
        fn encode(
            &mut self,
            rgba: Vec<u8>,
            timestamp_us: u64,
            _duration_us: u64,
            keyframe: bool,
        ) -> Result<Vec<EncodedChunk>> {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.seen
                .lock()
                .expect("encoder lock")
                .push((timestamp_us, keyframe));
            Ok(vec![EncodedChunk {
                track: Track::Video,
                timestamp_us,
                duration_us: 1,
                keyframe,
                data: rgba[..4].to_vec(),
            }])
        }

        fn flush(&mut self) -> Result<Vec<EncodedChunk>> {
            self.flushed.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    struct Probes {
        seen: Arc<Mutex<Vec<(u64, bool)>>>,
        flushed: Arc<AtomicUsize>,
    }

    fn pipeline_with_probes(delay: Duration) -> (VideoPipeline, Probes) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let flushed = Arc::new(AtomicUsize::new(0));

        let mux = Arc::new(Mutex::new(ChunkMux::new(Box::new(NullWriter))));
        let pipeline = VideoPipeline::spawn(
            Box::new(ProbeEncoder {
                delay,
                seen: Arc::clone(&seen),
                flushed: Arc::clone(&flushed),
            }),
            mux,
        )
        .expect("pipeline spawn");

        (pipeline, Probes { seen, flushed })
    }

    fn frame() -> RasterFrame {
        RasterFrame::new(FRAME_WIDTH, FRAME_HEIGHT)
    }

    #[test]
    fn timestamps_and_keyframe_cadence() {
        let (mut pipeline, probes) = pipeline_with_probes(Duration::ZERO);
        for tick in 0..200 {
            pipeline.submit_frame(tick, frame()).expect("submit");
        }
        pipeline.finish().expect("finish");

        let seen = probes.seen.lock().expect("encoder lock");
        assert_eq!(seen.len(), 200);
        let mut previous = None;
        for (tick, (timestamp_us, keyframe)) in seen.iter().enumerate() {
            assert_eq!(*timestamp_us, tick as u64 * 1_000_000 / 30);
            assert_eq!(*keyframe, tick % 90 == 0, "keyframe flag at tick {tick}");
            if let Some(p) = previous {
                assert!(*timestamp_us > p);
            }
            previous = Some(*timestamp_us);
        }
        assert_eq!(probes.flushed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn out_of_order_submission_is_rejected() {
        let (mut pipeline, _probes) = pipeline_with_probes(Duration::ZERO);
        pipeline.submit_frame(0, frame()).expect("submit");
        assert!(pipeline.submit_frame(2, frame()).is_err());
        assert!(pipeline.submit_frame(0, frame()).is_err());
    }

    #[test]
    fn in_flight_count_never_exceeds_the_limit() {
        let (mut pipeline, _probes) = pipeline_with_probes(Duration::from_millis(2));

        let mut observed_max = 0;
        for tick in 0..120 {
            pipeline.submit_frame(tick, frame()).expect("submit");
            observed_max = observed_max.max(pipeline.in_flight());
        }
        pipeline.finish().expect("finish");

        assert!(
            observed_max <= VIDEO_IN_FLIGHT_LIMIT,
            "saw {observed_max} requests in flight"
        );
        assert!(observed_max > 1, "backpressure test should actually queue");
    }

    #[test]
    fn finish_waits_for_outstanding_work() {
        let (mut pipeline, probes) = pipeline_with_probes(Duration::from_millis(1));
        for tick in 0..40 {
            pipeline.submit_frame(tick, frame()).expect("submit");
        }
        pipeline.finish().expect("finish");
        assert_eq!(probes.seen.lock().expect("encoder lock").len(), 40);
    }
}

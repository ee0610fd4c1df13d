//! Container multiplexer.
//!
//! Accepts encoded chunks from both pipelines as they are produced, streams
//! each payload straight to the container-writer service, and keeps only the
//! chunk metadata. Finalize merges the two metadata tracks into one sequence
//! ordered purely by timestamp and hands it to the writer; afterwards the
//! muxer accepts nothing more.

use anyhow::{bail, Result};

use crate::codec::{ChunkMeta, ContainerWriter, EncodedChunk, Track};

pub struct ChunkMux {
    writer: Box<dyn ContainerWriter>,
    video: Vec<ChunkMeta>,
    audio: Vec<ChunkMeta>,
    finalized: bool,
}

impl ChunkMux {
    pub fn new(writer: Box<dyn ContainerWriter>) -> Self {
        Self {
            writer,
            video: Vec::new(),
            audio: Vec::new(),
            finalized: false,
        }
    }

    pub fn add(&mut self, chunk: EncodedChunk) -> Result<()> {
        if self.finalized {
            bail!("cannot add chunks after the container was finalized");
        }

        let track = match chunk.track {
            Track::Video => &mut self.video,
            Track::Audio => &mut self.audio,
        };
        if let Some(last) = track.last() {
            if chunk.timestamp_us <= last.timestamp_us {
                bail!(
                    "{:?} chunk timestamps must strictly increase: {} after {}",
                    chunk.track,
                    chunk.timestamp_us,
                    last.timestamp_us
                );
            }
        }

        self.writer.write(&chunk)?;
        track.push(ChunkMeta::of(&chunk));
        Ok(())
    }

    pub fn chunk_counts(&self) -> (usize, usize) {
        (self.video.len(), self.audio.len())
    }

    /// Terminal: produces the finished container bytes exactly once.
    pub fn finalize(&mut self) -> Result<Vec<u8>> {
        if self.finalized {
            bail!("container was already finalized");
        }
        self.finalized = true;

        let schedule = interleave(&self.video, &self.audio);
        self.writer.finish(&schedule)
    }
}

/// Merge two per-track metadata sequences (each already monotone) into one
/// sequence ordered by timestamp; video wins ties so a keyframe lands before
/// the audio window that starts on it.
fn interleave(video: &[ChunkMeta], audio: &[ChunkMeta]) -> Vec<ChunkMeta> {
    let mut merged = Vec::with_capacity(video.len() + audio.len());
    let (mut v, mut a) = (0, 0);
    while v < video.len() && a < audio.len() {
        if video[v].timestamp_us <= audio[a].timestamp_us {
            merged.push(video[v]);
            v += 1;
        } else {
            merged.push(audio[a]);
            a += 1;
        }
    }
    merged.extend_from_slice(&video[v..]);
    merged.extend_from_slice(&audio[a..]);
    merged
}

//! Replay pack loading and integrity checking.
//!
//! A replay file is a JSON document wrapping a `pack` object. The pack's
//! `hash` field carries a rolling checksum of the pack serialized with the
//! hash zeroed; a mismatch is logged and conversion proceeds anyway, because
//! replays edited by hand (or saved by older clients) are still playable.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

/// One scheduled chat message: `[frameIndex, side, text]` in the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(u32, u8, String)", into = "(u32, u8, String)")]
pub struct ChatEvent {
    pub frame_index: u32,
    pub side: u8,
    pub text: String,
}

impl From<(u32, u8, String)> for ChatEvent {
    fn from((frame_index, side, text): (u32, u8, String)) -> Self {
        Self {
            frame_index,
            side,
            text,
        }
    }
}

impl From<ChatEvent> for (u32, u8, String) {
    fn from(event: ChatEvent) -> Self {
        (event.frame_index, event.side, event.text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayPack {
    pub hash: i32,
    #[serde(rename = "roomID")]
    pub room_id: String,
    pub nicknames: [String; 2],
    #[serde(rename = "partialPublicIPs")]
    pub partial_public_ips: [String; 2],
    /// Per-tick input records, opaque to the transcoder.
    pub inputs: Vec<serde_json::Value>,
    /// Game options, opaque to the transcoder.
    pub options: serde_json::Value,
    pub chats: Vec<ChatEvent>,
}

impl ReplayPack {
    pub fn total_ticks(&self) -> u32 {
        self.inputs.len() as u32
    }

    pub fn validate(&self) -> Result<()> {
        if self.inputs.is_empty() {
            bail!("replay contains no input frames");
        }
        for chat in &self.chats {
            if chat.side > 1 {
                bail!(
                    "chat event at frame {} names side {}, expected 0 or 1",
                    chat.frame_index,
                    chat.side
                );
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct ReplayDocument {
    pack: ReplayPack,
}

pub fn load_replay_file(path: &Path) -> Result<ReplayPack> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read replay file {}", path.display()))?;
    let document: ReplayDocument = serde_json::from_str(&contents).map_err(|error| {
        anyhow!(
            "failed to parse replay json in {} at line {}, column {}: {}",
            path.display(),
            error.line(),
            error.column(),
            error
        )
    })?;

    let pack = document.pack;
    pack.validate()
        .with_context(|| format!("invalid replay pack in {}", path.display()))?;

    if !verify_checksum(&pack) {
        warn!(
            "replay checksum mismatch in {} (stored {}, recomputed {}); converting anyway",
            path.display(),
            pack.hash,
            pack_checksum(&pack).unwrap_or(0)
        );
    }

    Ok(pack)
}

/// Recompute the pack checksum: the pack is re-serialized with `hash = 0`
/// and run through the live client's 31-based rolling string hash.
pub fn pack_checksum(pack: &ReplayPack) -> Result<i32> {
    let mut zeroed = pack.clone();
    zeroed.hash = 0;
    let serialized =
        serde_json::to_string(&zeroed).context("failed to re-serialize replay pack")?;
    Ok(string_hash(&serialized))
}

pub fn verify_checksum(pack: &ReplayPack) -> bool {
    match pack_checksum(pack) {
        Ok(recomputed) => recomputed == pack.hash,
        Err(_) => false,
    }
}

/// `hash = hash * 31 + code_unit` over UTF-16 code units, wrapping at i32,
/// matching the client's `getHashCode`.
fn string_hash(s: &str) -> i32 {
    let mut hash: i32 = 0;
    for unit in s.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    hash
}

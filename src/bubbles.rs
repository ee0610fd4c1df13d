//! Chat-bubble overlay state machine.
//!
//! Bubble placement must land on the same spot the live in-game chat display
//! picked, so the generator is seeded from the same fixed substring of the
//! room identifier and drawn in the same order: one draw for the vertical
//! position, one for the horizontal fraction.

use std::collections::VecDeque;

use crate::codec::{FRAME_HEIGHT, FRAME_WIDTH};
use crate::replay::ChatEvent;

/// 5 seconds at 30 ticks per second.
pub const BUBBLE_DURATION_FRAMES: u32 = 150;

/// Room ids carry a ten-character date prefix; the placement seed is derived
/// from everything after it.
const ROOM_ID_SEED_OFFSET: usize = 10;

/// Tiny deterministic PRNG (xorshift64*). Self-contained, integer-only.
#[derive(Debug, Clone, Copy)]
pub(crate) struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    /// `seed = 0` is remapped so the generator cannot lock into an all-zero
    /// sequence.
    pub const fn from_seed(seed: u64) -> Self {
        let mixed = seed ^ 0x9E37_79B9_7F4A_7C15;
        let state = if mixed == 0 {
            0xA076_1D64_78BD_642F
        } else {
            mixed
        };
        Self { state }
    }

    #[inline(always)]
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform f32 in [0, 1).
    #[inline(always)]
    pub fn next_unit(&mut self) -> f32 {
        ((self.next_u64() >> 40) as f32) / ((1u64 << 24) as f32)
    }
}

/// Placement seed shared with the live chat display: FNV-1a over the room
/// id's characters past the date prefix (the whole id when it is shorter).
pub fn placement_seed(room_id: &str) -> u64 {
    let tail = room_id
        .char_indices()
        .nth(ROOM_ID_SEED_OFFSET)
        .map_or("", |(i, _)| &room_id[i..]);
    let source = if tail.is_empty() { room_id } else { tail };

    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in source.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatBubble {
    pub side: u8,
    pub text: String,
    pub x: f32,
    pub y: f32,
    pub elapsed_frames: u32,
    pub total_duration_frames: u32,
    pub opacity: f32,
}

/// Fade-in / hold / fade-out envelope over the bubble lifetime.
pub fn fade_opacity(elapsed_frames: u32, total_duration_frames: u32) -> f32 {
    if total_duration_frames == 0 {
        return 0.0;
    }
    let p = elapsed_frames as f32 / total_duration_frames as f32;
    if p < 0.25 {
        p / 0.25
    } else if p < 0.75 {
        1.0
    } else {
        (1.0 - (p - 0.75) / 0.25).max(0.0)
    }
}

/// Advances the visible bubble set once per tick. At most one bubble per
/// side; a newly scheduled message evicts the side's live bubble.
pub struct BubbleAnimator {
    rng: XorShift64,
    schedule: VecDeque<ChatEvent>,
    live: [Option<ChatBubble>; 2],
}

impl BubbleAnimator {
    pub fn new(room_id: &str, chats: &[ChatEvent]) -> Self {
        let mut schedule: Vec<ChatEvent> = chats.to_vec();
        schedule.sort_by_key(|chat| chat.frame_index);
        Self {
            rng: XorShift64::from_seed(placement_seed(room_id)),
            schedule: schedule.into(),
            live: [None, None],
        }
    }

    /// Call once per tick, with ticks visited in order from zero.
    pub fn advance(&mut self, frame: u32) {
        while self
            .schedule
            .front()
            .is_some_and(|chat| chat.frame_index <= frame)
        {
            if let Some(chat) = self.schedule.pop_front() {
                self.spawn(chat);
            }
        }

        for slot in &mut self.live {
            if let Some(bubble) = slot {
                bubble.elapsed_frames += 1;
                if bubble.elapsed_frames >= bubble.total_duration_frames {
                    *slot = None;
                } else {
                    bubble.opacity =
                        fade_opacity(bubble.elapsed_frames, bubble.total_duration_frames);
                }
            }
        }
    }

    fn spawn(&mut self, chat: ChatEvent) {
        let r1 = self.rng.next_unit();
        let r2 = self.rng.next_unit();

        let y = FRAME_HEIGHT as f32 * (0.20 + 0.30 * r1);
        let fraction = 0.55 + 0.25 * r2;
        let x = if chat.side == 0 {
            FRAME_WIDTH as f32 * (1.0 - fraction)
        } else {
            FRAME_WIDTH as f32 * fraction
        };

        let side = usize::from(chat.side.min(1));
        self.live[side] = Some(ChatBubble {
            side: chat.side,
            text: chat.text,
            x,
            y,
            elapsed_frames: 0,
            total_duration_frames: BUBBLE_DURATION_FRAMES,
            opacity: 0.0,
        });
    }

    pub fn bubbles(&self) -> impl Iterator<Item = &ChatBubble> {
        self.live.iter().flatten()
    }

    pub fn live_count(&self) -> usize {
        self.live.iter().flatten().count()
    }
}

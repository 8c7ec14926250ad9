//! Synthesis repetition detection.
//!
//! The loop keeps the hashes of the last few synthesis outputs. A synthesis
//! whose hash is already in the window counts as a repeat; enough
//! consecutive repeats mark the loop stalled. Content identity is used
//! instead of scores because a model can plateau in wording while its
//! self-reported score keeps wobbling.

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::models::reflection::ReflectionState;

/// Result of checking one synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallCheck {
    /// Hash not seen in the window; the repeat counter was reset.
    Fresh,
    /// Hash already in the window, below the stall threshold.
    Repeated {
        /// Consecutive repeats so far.
        consecutive: u32,
    },
    /// Repeats reached the threshold; the state is now marked stalled.
    Stalled {
        /// Consecutive repeats at the time of stalling.
        consecutive: u32,
    },
}

/// SHA-256 hex digest of a synthesis, ignoring surrounding whitespace.
#[must_use]
pub fn synthesis_hash(synthesis: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(synthesis.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Record a synthesis hash and update the stall counters on `state`.
pub fn observe_hash(state: &mut ReflectionState, hash: String, threshold: u32) -> StallCheck {
    if state.response_hash_window.contains(&hash) {
        state.consecutive_stalls += 1;
    } else {
        state.consecutive_stalls = 0;
    }
    state.response_hash_window.push(hash);

    let consecutive = state.consecutive_stalls;
    if consecutive == 0 {
        StallCheck::Fresh
    } else if consecutive >= threshold {
        state.is_stalled = true;
        warn!(group_id = %state.group_id, consecutive, "synthesis output repeating, loop stalled");
        StallCheck::Stalled { consecutive }
    } else {
        debug!(group_id = %state.group_id, consecutive, "synthesis output repeated");
        StallCheck::Repeated { consecutive }
    }
}

/// Hash `synthesis` and record it; see [`observe_hash`].
pub fn observe_synthesis(state: &mut ReflectionState, synthesis: &str, threshold: u32) -> StallCheck {
    observe_hash(state, synthesis_hash(synthesis), threshold)
}

//! Per-invocation correlation ids
//!
//! Every invocation of an instrumented callback or transformer phase gets a
//! fresh id, so concurrent, nested and recursive invocations of the same
//! registration stay distinguishable in the ledger. Ids come from a
//! monotonically increasing atomic counter and are never reused by a mint.
//!
//! # Example
//!
//! ```
//! use hooktime::correlation::IdMint;
//!
//! let mint = IdMint::new();
//! let a = mint.tick();
//! let b = mint.tick();
//! assert!(a < b);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Token pairing the start and end events of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// Wrap a raw id, e.g. one read back from a saved ledger
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Source of fresh correlation ids
///
/// `tick()` is a single `fetch_add`, so minting stays cheap on the hot path
/// of every instrumented call.
#[derive(Debug)]
pub struct IdMint {
    counter: AtomicU64,
}

impl IdMint {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Mint the next id (first id is `#1`)
    pub fn tick(&self) -> CorrelationId {
        CorrelationId(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Last id handed out, `#0` if none yet
    pub fn last(&self) -> CorrelationId {
        CorrelationId(self.counter.load(Ordering::SeqCst))
    }
}

impl Default for IdMint {
    fn default() -> Self {
        Self::new()
    }
}

//! Zero-sized hash builder for the graph's internal id-keyed collections.
//!
//! Provides `GraphHashBuilder`, a zero-sized `BuildHasher` over foldhash with
//! a fixed seed. Node ids are process-internal, so HashDoS resistance is not
//! a concern; what matters is that the hasher adds no per-collection memory.

use std::hash::BuildHasher;

pub use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized `BuildHasher` using foldhash with a fixed seed.
///
/// Every instance hashes identically, so collections built from it need no
/// per-instance hasher state.
#[derive(Clone, Copy, Debug, Default)]
pub struct GraphHashBuilder;

impl BuildHasher for GraphHashBuilder {
    type Hasher = FoldHasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x2545f4914f6cdd1d).build_hasher()
    }
}

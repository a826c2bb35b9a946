//! Stream lineage and checkpoint ordering.
//!
//! Every execution commits onto a stream; streams fork from a parent
//! stream. Overlaying a set of checkpoints must apply parent work before
//! child work, and edits on unrelated streams to the same file are flagged.

mod ancestry;
mod overlay;

pub use ancestry::{AncestryMap, ConcurrentEdit, MAX_LINEAGE_DEPTH, concurrent_edits};
pub use overlay::{OverlayOrder, overlay_order};

// src/consumers/mod.rs
//! Thin downstream collaborators fed by the pipeline mailboxes.

use crate::core::Component;
use crate::events::SegmentRecord;

pub mod indexer;
pub mod recognizer;

pub use indexer::JsonlIndexer;
pub use recognizer::KeyframeRecognizer;

/// Sink for segment metadata.
pub trait Indexer: Component {
    /// Records one segment synchronously. Must keep working after `stop`,
    /// which is how the final chunk of a run gets indexed.
    fn index_segment(&mut self, record: SegmentRecord) -> anyhow::Result<()>;

    /// Indexes whatever producers queued after `stop`, once they have all
    /// stopped too. Returns the number of entries written.
    fn drain_pending(&mut self) -> anyhow::Result<usize>;
}

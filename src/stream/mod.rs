//! The stream coordinator core: offset table, checkpoint scheduler,
//! sub-stream supervision and the coordinator itself.

mod checkpoint;
mod coordinator;
mod offsets;
mod supervisor;

pub use checkpoint::{Checkpoint, CheckpointMetric};
pub use coordinator::{Metric, StreamCoordinator, StreamDeps};
pub use offsets::OffsetTable;

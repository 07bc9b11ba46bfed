//! Checkpoints: modelo, sellado con fingerprint e interfaz de store.

mod fingerprint;
mod model;
mod store;

pub use model::{Checkpoint, FlowOutcome, FrameRecord, SerializedCheckpoint, WaitCondition};
pub use store::{CheckpointStore, InMemoryCheckpointStore};

//! Keyed state and checkpointing

pub mod checkpoint;
pub mod store;

pub use checkpoint::{
    CapturedState, Checkpoint, CheckpointCoordinator, CheckpointSource, CheckpointStore,
    SourcePosition,
};
pub use store::{KeyedStateStore, StateSnapshot};

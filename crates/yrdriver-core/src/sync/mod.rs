//! Synchronization loop and the state it keeps current.

mod runner;
mod state;

pub use runner::{LoopState, SyncLoop};
pub use state::{GameState, NoopStep, RemoteState, Stage, StateSource, StepHandler};

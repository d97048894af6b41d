// Montage Core
// Step state machine over an optimistic-concurrency project repository

mod machine;
mod store;

pub use machine::{StepOutcome, StepStateMachine};
pub use store::{MemoryProjectStore, ProjectPatch, ProjectStore, StepExpectation};

mod recovery;
mod runner;
mod state;

#[cfg(test)]
mod tests;

pub use recovery::{Backoff, RecoveryPolicy};
pub use runner::{CaptureLoop, Step};
pub use state::LoopState;

//! The conversation streaming state machine.
//!
//! Owns the active-stream registry: `begin`/`append`/`finish`/`interrupt`/
//! `snapshot`. The callback-state-synchronisation hazard is
//! the reason every mutation here goes through a single `RwLock`-guarded
//! `HashMap` keyed by conversation id, mutated by re-fetching the entry
//! under the lock rather than through a pointer captured at `begin` time.

pub mod engine;

pub use engine::{ActiveStream, AppendOutcome, StreamStatus, StreamingEngine, TerminalStatus};

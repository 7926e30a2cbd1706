//! In-memory storage, state machine and network fixtures used by the test
//! suites. They are fully functional implementations of the collaborator
//! traits and double as reference implementations.

mod mem_log;
mod mem_sm;
mod router;

pub use mem_log::MemRaftLog;
pub use mem_sm::MemStateMachine;
pub use router::Router;

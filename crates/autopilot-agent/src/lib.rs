pub mod claude;
pub mod event;
pub mod instruction;
pub mod verdict;

pub use claude::ClaudeBackend;

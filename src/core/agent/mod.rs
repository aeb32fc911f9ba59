//! CLI coding agents run as subprocesses: per-agent stream parsers, the task
//! model, single processes and the bounded pool on top of them.

pub mod events;
pub mod plugin;
pub mod pool;
pub mod process;
pub mod task;

pub use events::AgentEvent;
pub use plugin::{AgentPlugin, plugin_for};
pub use pool::{AgentPool, PoolSettings};
pub use task::TaskRecord;

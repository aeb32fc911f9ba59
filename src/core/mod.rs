pub mod agent;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod lifecycle;
pub mod protocol;
pub mod retry;
pub mod sideband;
pub mod state;
pub mod terminal;
pub mod ttl;
pub mod uploads;

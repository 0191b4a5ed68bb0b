// tandem-client: transport-agnostic connection manager for the tandem hub.

pub mod config;
pub mod dedup;
pub mod driver;
pub mod listeners;
pub mod manager;
pub mod queue;

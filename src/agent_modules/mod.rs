pub mod checkers;
pub mod checklist;
pub mod config;
pub mod context;
pub mod debounce;
pub mod envelope;
pub mod heartbeat;
pub mod job;
pub mod publisher;
pub mod registry;
pub mod scheduler;
pub mod store;

pub mod handoff;
pub mod lock;
pub mod workflow;

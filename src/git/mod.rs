pub mod branch;
pub mod history;

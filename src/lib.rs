#![deny(clippy::all)]

pub mod bytefmt;
pub mod cli;
pub mod comm;
pub mod coordinator;
pub mod names;
pub mod path;
pub mod queue;
pub mod usage;
pub mod walk;

pub mod config;
pub mod logging;

pub mod batch;
pub mod classify;
pub mod command;
pub mod control;
pub mod engine;
pub mod job;
pub mod progress;
pub mod services;
pub mod store;
pub mod supervisor;

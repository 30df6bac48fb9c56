// Common library for the task scheduler: triggers, job store, scheduler engine, control plane

pub mod bootstrap;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod errors;
pub mod job;
pub mod job_store;
pub mod persistence;
pub mod process;
pub mod scheduler;
pub mod task;
pub mod telemetry;
pub mod trigger;

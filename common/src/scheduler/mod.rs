// Scheduler module: in-memory job table and the clock-driven firing loop

pub mod engine;

pub use engine::{Scheduler, SchedulerConfig, SchedulerEngine};

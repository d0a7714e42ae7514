//! Background services

pub mod rotation_scheduler;

pub use rotation_scheduler::RotationScheduler;

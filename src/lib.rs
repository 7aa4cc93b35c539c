pub mod config;
pub mod diagnostic;
pub mod motor;
pub mod report;

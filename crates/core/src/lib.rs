pub mod drain;
pub mod prelude;
pub mod readiness;
pub mod signal;
pub mod telemetry;

//! Synthetic traffic generation for tests
//!
//! Frame and payload builders used by the unit tests and the integration
//! suites. Everything here produces real wire-format bytes so the same
//! parsing paths run as in production.

pub mod collector;
pub mod frames;

pub use collector::EventCollector;

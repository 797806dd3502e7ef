//! Callscope backend library.
//!
//! Tracks cryptocurrency tokens called in chat channels over a fixed 30-day
//! window, classifies outcomes, and learns a per-channel expected-ROI
//! reputation. Exposed as a library for the `callscope` binary and the
//! integration tests.

pub mod app;
pub mod bootstrap;
pub mod config;
pub mod exports;
pub mod live;
pub mod mentions;
pub mod models;
pub mod persist;
pub mod price;
pub mod providers;
pub mod reputation;
pub mod stats;
pub mod tracking;

pub use app::{process_mention, AppContext, Disposition, Mode};
pub use bootstrap::BootstrapOrchestrator;
pub use config::Config;
pub use live::LiveOrchestrator;

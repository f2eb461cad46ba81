//! Side-effecting adapters (filesystem, processes, dashboards) behind traits.

pub mod config;
pub mod cycle_log;
pub mod deploy;
pub mod generate;
pub mod process;
pub mod screen;
pub mod sink;
pub mod store;

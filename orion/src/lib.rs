//! Multi-agent autonomous supervision loop.
//!
//! Orion drives one or more orchestrator instances through generate, review,
//! gate, and deploy cycles while a guardian supervisor watches for stalls and
//! issues audited recovery commands. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (lease arithmetic, policy and veto
//!   gates, progress and stall classification, circuit breaking). Time is
//!   passed in explicitly; no I/O.
//! - **[`io`]**: Side-effecting adapters (config, persistence, generator,
//!   deployer and screen processes, dashboard sinks) behind traits so tests
//!   can substitute fakes.
//!
//! Orchestration modules ([`hub`], [`lease`], [`queue`], [`cycle`],
//! [`looping`], [`driver`], [`supervisor`]) combine the two, and [`control`]
//! assembles them into a [`control::Runtime`] behind one operator surface.

pub mod agents;
pub mod clock;
pub mod control;
pub mod core;
pub mod cycle;
pub mod driver;
pub mod error;
pub mod exit_codes;
pub mod hub;
pub mod io;
pub mod lease;
pub mod logging;
pub mod looping;
pub mod queue;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

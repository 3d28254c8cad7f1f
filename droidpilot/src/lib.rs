//! Objective-tracking replan engine for mobile test automation.
//!
//! A free-text test procedure is decomposed into objective steps, then driven
//! to a verdict by a loop that observes the device screen, decides whether to
//! keep planning or conclude, and executes one action at a time. The
//! architecture keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (progress tracking, decision
//!   policy, budgets, retry). No I/O beyond retry backoff sleeps, fully
//!   testable in isolation.
//! - **[`io`]**: Side-effecting collaborators (device, oracle processes,
//!   config, reports). Behind traits so tests can script them.
//! - **[`agents`]**: Oracle-backed stages built on `io` prompts and schemas.
//!
//! [`looping`] and [`step`] coordinate the three into `droidpilot run`.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

//! Sandbox orchestration core.
//!
//! Sandboxes are containers owned by a long-lived manager container. This
//! crate never talks to sandboxes directly: every action is a subcommand of
//! the manager's CLI, run through the container runtime. On top of that it
//! keeps a typed view of the sandboxes, refuses to stop or destroy the
//! container it runs in, tracks long actions as pollable operations, and
//! runs source code in ephemeral or persistent sandboxes.

pub mod config;
pub mod execution;
pub mod notifications;
pub mod operation;
pub mod process;
pub mod sandbox;

#[cfg(test)]
mod testing;

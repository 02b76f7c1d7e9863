//! Application-level orchestration.
//!
//! Owns the run lifecycle (start, operator commands, completion) and post-run
//! processing such as the history refresh. The CLI calls into this module to
//! keep responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{run_controller, ControllerCtx, RunRequest, UiCommand};

//! Pre-fork master/worker harness (SPEC_FULL.md §11 "master harness"): a
//! small, deliberately minimal caller for the five server-lifecycle hooks
//! in [`crate::multiproc::hooks`]. It is not part of the core's public
//! contract — it exists to fork real OS worker processes, supervise them
//! (spawn, restart on timeout/abort/quit, signal fan-out), and give
//! [`crate::multiproc`] a real multi-process caller to exercise end to end.
//!
//! Forking after a Tokio runtime has started is unsupported (only the
//! forking thread survives into the child), so [`master::run`] forks
//! every worker from a plain synchronous `main` before either process
//! builds its own `tokio::runtime::Runtime`.

pub mod master;
pub mod worker;

use crate::multiproc::Pid;

/// Converts a `nix` OS pid into the core's [`Pid`] type.
fn as_core_pid(pid: nix::unistd::Pid) -> Pid {
    #[allow(clippy::cast_sign_loss)]
    {
        pid.as_raw() as Pid
    }
}

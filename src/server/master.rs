//! Master process: forks `config.workers` worker processes before any
//! Tokio runtime exists (see [`super`]'s module docs on fork safety), then
//! builds its own single-threaded runtime to serve the scrape endpoint,
//! fan out signals, and supervise worker lifecycle — spawn, restart on
//! timeout/abort/quit, signal fan-out.

use super::{as_core_pid, worker};
use crate::multiproc::config::CoreConfig;
use crate::multiproc::hooks::{self, MasterSignalCounters};
use crate::multiproc::manager::StorageManager;
use crate::multiproc::{AggregationMode, MetricFamily, MetricType};
use anyhow::{Context, Result};
use axum_server::Handle;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Demo application's metric families (SPEC_FULL.md §11), registered once
/// so the collector knows every family's aggregation rule up front (§4.4
/// step 4 needs the rule *before* it can group a scraped sample).
fn demo_families() -> Vec<MetricFamily> {
    vec![
        MetricFamily {
            name: "requests_total".to_string(),
            metric_type: MetricType::Counter,
            aggregation_mode: AggregationMode::Sum,
            help_text: "Total requests handled.".to_string(),
            label_names: vec!["route".to_string()],
        },
        MetricFamily {
            name: "worker_memory_bytes".to_string(),
            metric_type: MetricType::Gauge,
            aggregation_mode: AggregationMode::All,
            help_text: "Resident memory observed by the worker.".to_string(),
            label_names: vec![],
        },
        MetricFamily {
            name: "request_latency_seconds".to_string(),
            metric_type: MetricType::Histogram,
            aggregation_mode: AggregationMode::Sum,
            help_text: "Request latency distribution.".to_string(),
            label_names: vec![],
        },
    ]
}

/// Forks one worker process. The child never returns: it builds its own
/// runtime, runs the demo hot path, and exits. The parent returns the
/// child's pid so the caller can track/supervise it.
///
/// # Safety
/// Must be called before the calling process has spawned any extra OS
/// threads (fork() only preserves the calling thread in the child).
fn spawn_worker(config: &CoreConfig, verbosity: Option<tracing::Level>) -> Result<nix::unistd::Pid> {
    // SAFETY: the master forks its initial worker set before building any
    // Tokio runtime, and every respawn happens from a dedicated
    // supervision thread that performs no other concurrent work, so the
    // forked child inherits no partially-held locks from sibling threads.
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Child => {
            let pid = as_core_pid(nix::unistd::getpid());
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(err) => {
                    eprintln!("worker {pid}: failed to build runtime: {err}");
                    std::process::exit(1);
                }
            };
            let exit_code = match rt.block_on(worker::run(config, pid, verbosity)) {
                Ok(()) => 0,
                Err(err) => {
                    warn!(pid, error = %err, "worker exited with error");
                    1
                }
            };
            std::process::exit(exit_code);
        }
        ForkResult::Parent { child } => Ok(child),
    }
}

/// Signal reasons the master fans out to [`MasterSignalCounters`] (§4.6).
/// `abrt` is recorded when supervision observes a child killed by
/// `SIGABRT`, not from the master's own signal handler (a process cannot
/// receive `SIGABRT` targeted at a different process).
const TERMINATING_REASONS: &[&str] = &["quit", "int", "term"];

struct Supervisor {
    config: CoreConfig,
    verbosity: Option<tracing::Level>,
    manager: Arc<StorageManager>,
    counters: Arc<MasterSignalCounters>,
    children: Mutex<Vec<nix::unistd::Pid>>,
    shutting_down: AtomicBool,
}

impl Supervisor {
    /// Blocking reap loop: waits for any child to exit, records the
    /// reason (timeout/abort/quit all surface here as the worker simply
    /// exiting or being killed), and — unless shutdown is in progress —
    /// forks a replacement so the worker count stays at `config.workers`.
    fn supervise(&self) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) && self.children.lock().map_or(true, |c| c.is_empty()) {
                return;
            }

            match waitpid(None::<nix::unistd::Pid>, None) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.on_child_gone(pid, &format!("exited({code})"));
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    let reason = match signal {
                        Signal::SIGABRT => "abrt",
                        Signal::SIGQUIT => "quit",
                        _ => "signaled",
                    };
                    self.counters.record(reason);
                    self.on_child_gone(pid, reason);
                }
                Ok(_) => {}
                Err(nix::errno::Errno::ECHILD) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "waitpid failed");
                }
            }
        }
    }

    fn on_child_gone(&self, pid: nix::unistd::Pid, reason: &str) {
        let core_pid = as_core_pid(pid);
        hooks::worker_int(&self.manager, core_pid);
        if let Ok(mut children) = self.children.lock() {
            children.retain(|p| *p != pid);
        }

        if self.shutting_down.load(Ordering::SeqCst) {
            info!(pid = core_pid, reason, "worker exited during shutdown");
            return;
        }

        warn!(pid = core_pid, reason, "worker died, respawning");
        match spawn_worker(&self.config, self.verbosity) {
            Ok(new_pid) => {
                hooks::post_fork(&self.manager, as_core_pid(new_pid));
                if let Ok(mut children) = self.children.lock() {
                    children.push(new_pid);
                }
            }
            Err(err) => warn!(error = %err, "failed to respawn worker"),
        }
    }

    fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Ok(children) = self.children.lock() {
            for pid in children.iter() {
                let _ = nix::sys::signal::kill(*pid, Signal::SIGTERM);
            }
        }
    }
}

/// Runs the master process to completion: forks workers, serves the
/// scrape endpoint, and blocks until a terminating signal arrives.
///
/// # Errors
/// Returns an error if configuration validation, the initial fork, or the
/// scrape server fails.
pub fn run(config: CoreConfig, verbosity: Option<tracing::Level>) -> Result<()> {
    let counters = hooks::on_starting(&config)?;
    let worker_count = config.workers.unwrap_or(1);

    let mut initial_children = Vec::with_capacity(worker_count as usize);
    for _ in 0..worker_count {
        initial_children.push(spawn_worker(&config, verbosity)?);
    }

    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().context("failed to build master runtime")?;

    rt.block_on(async move {
        crate::cli::telemetry::init(verbosity)?;

        let master_pid = as_core_pid(nix::unistd::getpid());
        let manager = Arc::new(StorageManager::setup(&config, master_pid).await?);
        for pid in &initial_children {
            hooks::post_fork(&manager, as_core_pid(*pid));
        }

        let supervisor = Arc::new(Supervisor {
            config: config.clone(),
            verbosity,
            manager: manager.clone(),
            counters: counters.clone(),
            children: Mutex::new(initial_children),
            shutting_down: AtomicBool::new(false),
        });

        let supervisor_for_thread = supervisor.clone();
        let reap_thread = std::thread::spawn(move || supervisor_for_thread.supervise());

        let collector = Arc::new(
            manager
                .get_collector(demo_families())
                .with_signal_counters(counters.clone()),
        );

        let bind_address = config.bind_address.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        let port = config.metrics_port.unwrap_or(9432);
        let listener = hooks::when_ready(&bind_address, port, 5).await.context("failed to bind scrape endpoint")?;

        let handle = Handle::new();
        let signal_task = tokio::spawn(signal_fanout(counters.clone(), supervisor.clone(), handle.clone()));

        let serve_result = crate::exporter::serve(&config, listener, collector, handle).await;

        supervisor.request_shutdown();
        signal_task.abort();
        let _ = reap_thread.join();

        hooks::on_exit(&manager, &config, master_pid).await;
        serve_result
    })
}

/// Fans out every master-observed signal to [`MasterSignalCounters`]
/// (§4.6); on a terminating signal, records it synchronously *before*
/// initiating shutdown (§4.6: "the increment happens synchronously before
/// shutdown so the next scrape ... observes it") and triggers a graceful
/// stop of the scrape server and every worker.
async fn signal_fanout(counters: Arc<MasterSignalCounters>, supervisor: Arc<Supervisor>, handle: Handle) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hup = signal(SignalKind::hangup())?;
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;
    let mut ttin = signal(SignalKind::from_raw(21))?;
    let mut ttou = signal(SignalKind::from_raw(22))?;
    let mut quit = signal(SignalKind::quit())?;
    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;

    loop {
        let reason = tokio::select! {
            _ = hup.recv() => "hup",
            _ = usr1.recv() => "usr1",
            _ = usr2.recv() => "usr2",
            _ = ttin.recv() => "ttin",
            _ = ttou.recv() => "ttou",
            _ = quit.recv() => "quit",
            _ = int.recv() => "int",
            _ = term.recv() => "term",
        };

        counters.record(reason);
        info!(reason, "master received signal");

        if TERMINATING_REASONS.contains(&reason) {
            supervisor.request_shutdown();
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
            return Ok(());
        }
    }
}

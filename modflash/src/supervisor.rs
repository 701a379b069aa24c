//! Multi-module update supervisor.
//!
//! Spawns one worker thread per discovered port, each running a full
//! [`ModuleUpdater`] pass, and polls their status records to aggregate
//! progress for the UI sinks. Workers never see each other; the supervisor
//! only reads their monotone state fields.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::catalog::VersionCatalog;
use crate::error::{Error, Result};
use crate::port::Port;
use crate::updater::{ModuleUpdater, UpdaterStatus, UpdaterTiming};

/// At most this many ports are updated in one run.
pub const MAX_CONCURRENT_UPDATES: usize = 10;

/// Supervisor poll cadence.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Reporting lifecycle of one worker slot. Advances monotonically
/// Running -> JustFinished -> Reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotPhase {
    Running,
    JustFinished,
    Reported,
}

/// Receiver for per-device and aggregate progress events.
///
/// All methods default to no-ops and are invoked from the supervisor thread
/// only, so implementations need no synchronization of their own.
pub trait UpdateEventSink {
    /// A device's uuid became known (formatted `0x…`).
    fn device_uuid(&mut self, index: usize, uuid: &str) {
        let _ = (index, uuid);
    }

    /// A running device reported progress, 0..=100.
    fn device_progress(&mut self, index: usize, percent: u8) {
        let _ = (index, percent);
    }

    /// A device finished: 0 for success, -1 for failure.
    fn device_state(&mut self, index: usize, state: i32) {
        let _ = (index, state);
    }

    /// A device failed with this message.
    fn device_error(&mut self, index: usize, message: &str) {
        let _ = (index, message);
    }

    /// Aggregate progress across all devices, 0..=100.
    fn total_progress(&mut self, percent: u8) {
        let _ = percent;
    }

    /// Aggregate status text.
    fn total_status(&mut self, status: &str) {
        let _ = status;
    }
}

/// Sink that drops every event.
pub struct NullSink;

impl UpdateEventSink for NullSink {}

/// Final outcome of one worker, collected after the run.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// Port the worker was attached to.
    pub port: String,
    /// Module uuid, if it ever identified.
    pub uuid: Option<u64>,
    /// Whether the update succeeded.
    pub ok: bool,
    /// Failure message, empty on success.
    pub message: String,
}

/// Drives concurrent firmware updates over many ports.
pub struct MultiUpdater {
    firmware_root: PathBuf,
    timing: UpdaterTiming,
    update_in_progress: Arc<AtomicBool>,
    task_end_callback: Option<Box<dyn FnOnce() + Send>>,
}

impl MultiUpdater {
    /// Create a supervisor resolving firmware images under `firmware_root`.
    pub fn new(firmware_root: impl Into<PathBuf>) -> Self {
        Self {
            firmware_root: firmware_root.into(),
            timing: UpdaterTiming::default(),
            update_in_progress: Arc::new(AtomicBool::new(false)),
            task_end_callback: None,
        }
    }

    /// Replace the timing profile handed to every worker.
    #[must_use]
    pub fn with_timing(mut self, timing: UpdaterTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Invoke `callback` once, when the whole run has terminated.
    pub fn set_task_end_callback(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.task_end_callback = Some(Box::new(callback));
    }

    /// Whether a run is currently active.
    pub fn is_update_in_progress(&self) -> bool {
        self.update_in_progress.load(Ordering::SeqCst)
    }

    /// Update every port concurrently, one worker thread per port.
    ///
    /// `opener` turns a port name into an open [`Port`]; ports that fail to
    /// open are logged and skipped. Returns the per-port outcomes once all
    /// workers have finished and been reported.
    pub fn run<P, F>(
        &mut self,
        ports: &[String],
        opener: F,
        catalog: &VersionCatalog,
        sink: &mut dyn UpdateEventSink,
    ) -> Result<Vec<UpdateOutcome>>
    where
        P: Port + 'static,
        F: Fn(&str) -> Result<P>,
    {
        if ports.is_empty() {
            return Err(Error::NoPortConnected);
        }

        struct Worker {
            port: String,
            status: Arc<UpdaterStatus>,
            handle: thread::JoinHandle<()>,
        }

        let mut workers: Vec<Worker> = Vec::new();
        for port_name in ports.iter().take(MAX_CONCURRENT_UPDATES) {
            let port = match opener(port_name) {
                Ok(port) => port,
                Err(e) => {
                    warn!("open {port_name} failed: {e}");
                    continue;
                }
            };

            let mut updater = ModuleUpdater::new(port, &self.firmware_root)
                .with_timing(self.timing.clone());
            let status = updater.status();
            let catalog = catalog.clone();
            // Outcome lands in the status record; the Err duplicate is dropped.
            let handle = thread::spawn(move || {
                let _ = updater.run(&catalog);
            });

            workers.push(Worker {
                port: port_name.clone(),
                status,
                handle,
            });
        }

        if workers.is_empty() {
            return Err(Error::NoPortConnected);
        }

        info!("updating {} module(s)", workers.len());
        self.update_in_progress.store(true, Ordering::SeqCst);

        let share = 100.0 / workers.len() as f64;
        let mut phases = vec![SlotPhase::Running; workers.len()];
        let mut uuid_seen = vec![false; workers.len()];

        loop {
            let mut all_done = true;
            let mut total = 0.0f64;

            for (i, worker) in workers.iter().enumerate() {
                if !uuid_seen[i] {
                    if let Some(uuid) = worker.status.uuid() {
                        sink.device_uuid(i, &format!("0x{uuid:X}"));
                        uuid_seen[i] = true;
                    }
                }

                match phases[i] {
                    SlotPhase::Running => {
                        all_done = false;
                        if worker.status.update_error() == 0 {
                            let percent = worker.status.progress();
                            total += f64::from(percent) * share / 100.0;
                            sink.device_progress(i, percent);
                        } else {
                            total += share;
                            phases[i] = SlotPhase::JustFinished;
                        }
                    }
                    SlotPhase::JustFinished => {
                        total += share;
                        if worker.status.update_error() == 1 {
                            sink.device_state(i, 0);
                            sink.device_progress(i, 100);
                        } else {
                            let message = worker.status.error_message();
                            error!("{}: {message}", worker.port);
                            sink.device_state(i, -1);
                            sink.device_error(i, &message);
                        }
                        phases[i] = SlotPhase::Reported;
                    }
                    SlotPhase::Reported => total += share,
                }
            }

            // Rounding keeps the published total monotone and lands it on
            // exactly 100 once every share is credited.
            sink.total_progress(total.round().min(100.0) as u8);
            sink.total_status("Update...");

            if all_done {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        let mut outcomes = Vec::with_capacity(workers.len());
        for worker in workers {
            let _ = worker.handle.join();
            outcomes.push(UpdateOutcome {
                port: worker.port,
                uuid: worker.status.uuid(),
                ok: worker.status.update_error() == 1,
                message: worker.status.error_message(),
            });
        }

        self.update_in_progress.store(false, Ordering::SeqCst);
        if let Some(callback) = self.task_end_callback.take() {
            callback();
        }

        Ok(outcomes)
    }
}

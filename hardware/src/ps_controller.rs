//! Serialized command controller for the two quadrupole supplies.
//!
//! Every request to either supply goes through one FIFO queue consumed by a
//! single worker thread that owns the [`GenesysBus`], so the shared line is
//! never driven by two callers at once. Callers block on a per-call reply
//! channel with a bounded timeout.
//!
//! A refresh thread polls both supplies' status on a fixed interval through
//! the same queue and publishes a [`PsSnapshot`] to registered callbacks. The
//! optimizer pauses it for the duration of a run so polling does not delay
//! current changes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, unbounded, RecvTimeoutError, Sender};
use shared::callback::{CallbackId, CallbackRegistry};
use shared::settings::PowerSupplySettings;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::genesys::{GenesysBus, GenesysCommand, GenesysError, GenesysResult, PsStatus};

/// The two controlled supplies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Supply {
    Q1,
    Q2,
}

impl Supply {
    pub const ALL: [Supply; 2] = [Supply::Q1, Supply::Q2];

    fn index(self) -> usize {
        match self {
            Supply::Q1 => 0,
            Supply::Q2 => 1,
        }
    }
}

impl fmt::Display for Supply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Supply::Q1 => f.write_str("PS1"),
            Supply::Q2 => f.write_str("PS2"),
        }
    }
}

/// Which supplies answered when the outputs were switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionReport {
    pub q1: bool,
    pub q2: bool,
}

impl ConnectionReport {
    pub fn all(&self) -> bool {
        self.q1 && self.q2
    }

    pub fn any(&self) -> bool {
        self.q1 || self.q2
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PsError {
    #[error("{supply}: {source}")]
    Device {
        supply: Supply,
        #[source]
        source: GenesysError,
    },

    #[error("{supply}: no reply to {command:?} within {timeout:?}")]
    Timeout {
        supply: Supply,
        command: String,
        timeout: Duration,
    },

    #[error("command worker has stopped")]
    WorkerStopped,

    #[error("could not connect the power supplies ({0:?})")]
    ConnectionFailed(ConnectionReport),

    #[error("failed to spawn thread: {0}")]
    Spawn(String),
}

/// Status of both supplies at one refresh.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PsSnapshot {
    pub q1: PsStatus,
    pub q2: PsStatus,
}

/// What the optimizer needs from the supplies.
pub trait PowerSupplyControl: Send + Sync {
    /// Program both currents, blocking until each supply acknowledged.
    fn set_currents(&self, currents: [f64; 2]) -> Result<(), PsError>;

    fn pause_refresh(&self);

    fn resume_refresh(&self);
}

struct Job {
    address: u8,
    command: GenesysCommand,
    reply: Sender<GenesysResult<String>>,
}

enum Message {
    Job(Job),
    Stop,
}

/// Cloneable handle that enqueues calls for the worker.
#[derive(Clone)]
pub struct CommandClient {
    sender: Sender<Message>,
    addresses: [u8; 2],
    call_timeout: Duration,
}

impl CommandClient {
    /// Enqueue one command and wait for its reply.
    pub fn call(&self, supply: Supply, command: GenesysCommand) -> Result<String, PsError> {
        let (reply_tx, reply_rx) = bounded(1);
        let wire = command.wire();
        let job = Job {
            address: self.addresses[supply.index()],
            command,
            reply: reply_tx,
        };
        self.sender
            .send(Message::Job(job))
            .map_err(|_| PsError::WorkerStopped)?;

        match reply_rx.recv_timeout(self.call_timeout) {
            Ok(result) => result.map_err(|source| PsError::Device { supply, source }),
            Err(RecvTimeoutError::Timeout) => Err(PsError::Timeout {
                supply,
                command: wire,
                timeout: self.call_timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(PsError::WorkerStopped),
        }
    }

    pub fn status(&self, supply: Supply) -> Result<PsStatus, PsError> {
        let reply = self.call(supply, GenesysCommand::Status)?;
        Ok(PsStatus::parse(&reply))
    }

    /// Status of both supplies; failures yield placeholder readings.
    pub fn snapshot(&self) -> PsSnapshot {
        let read = |supply| {
            self.status(supply).unwrap_or_else(|e| {
                warn!("Status refresh failed: {e}");
                PsStatus::default()
            })
        };
        PsSnapshot {
            q1: read(Supply::Q1),
            q2: read(Supply::Q2),
        }
    }
}

struct RefreshJob {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct PsController {
    client: CommandClient,
    worker: Mutex<Option<JoinHandle<()>>>,
    refresh: Mutex<Option<RefreshJob>>,
    refresh_paused: Arc<AtomicBool>,
    callbacks: Arc<CallbackRegistry<PsSnapshot>>,
    latest: Arc<Mutex<PsSnapshot>>,
}

impl PsController {
    /// Start the command worker, switch both outputs on and begin refreshing.
    ///
    /// If only one supply answers it is switched back off and the connection
    /// fails, as does a connection where neither answers.
    pub fn connect(bus: GenesysBus, settings: &PowerSupplySettings) -> Result<Self, PsError> {
        let (sender, receiver) = unbounded::<Message>();

        let worker = std::thread::Builder::new()
            .name("ps-command-worker".into())
            .spawn(move || {
                let mut bus = bus;
                debug!("Command worker started");
                while let Ok(message) = receiver.recv() {
                    let job = match message {
                        Message::Job(job) => job,
                        Message::Stop => break,
                    };
                    let result = bus.execute(job.address, &job.command);
                    match &result {
                        Ok(reply) => debug!(address = job.address, "{} -> {}", job.command, reply),
                        Err(e) => warn!(address = job.address, "{} failed: {}", job.command, e),
                    }
                    // caller may have timed out and gone away
                    let _ = job.reply.send(result);
                }
                debug!("Command worker stopped");
            })
            .map_err(|e| PsError::Spawn(e.to_string()))?;

        let controller = Self {
            client: CommandClient {
                sender,
                addresses: [settings.q1_address, settings.q2_address],
                call_timeout: settings.call_timeout(),
            },
            worker: Mutex::new(Some(worker)),
            refresh: Mutex::new(None),
            refresh_paused: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(CallbackRegistry::new()),
            latest: Arc::new(Mutex::new(PsSnapshot::default())),
        };

        let report = controller.switch_outputs_on();
        if !report.all() {
            if report.any() {
                error!("Could not connect to one of the power supplies");
            } else {
                error!("Could not connect the power supplies");
            }
            for supply in Supply::ALL {
                let connected = match supply {
                    Supply::Q1 => report.q1,
                    Supply::Q2 => report.q2,
                };
                if connected {
                    controller.switch_output(supply, false);
                }
            }
            controller.stop_worker();
            return Err(PsError::ConnectionFailed(report));
        }

        controller.refresh();
        controller.start_refresh(settings.refresh_interval())?;
        Ok(controller)
    }

    fn switch_outputs_on(&self) -> ConnectionReport {
        let mut connected = [false; 2];
        for supply in Supply::ALL {
            match self.client.call(supply, GenesysCommand::SetOutput(true)) {
                Ok(_) => {
                    connected[supply.index()] = true;
                    match self.client.call(supply, GenesysCommand::OutputStatus) {
                        Ok(state) => info!("{supply}: output {state}"),
                        Err(e) => warn!("{supply}: {e}"),
                    }
                }
                Err(e) => error!("{supply}: no response from device ({e})"),
            }
        }
        ConnectionReport {
            q1: connected[0],
            q2: connected[1],
        }
    }

    fn switch_output(&self, supply: Supply, on: bool) {
        match self.client.call(supply, GenesysCommand::SetOutput(on)) {
            Ok(reply) => info!("{supply}: {reply}"),
            Err(e) => warn!("{supply}: failed to switch output: {e}"),
        }
    }

    fn start_refresh(&self, interval: Duration) -> Result<(), PsError> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let client = self.client.clone();
        let paused = self.refresh_paused.clone();
        let callbacks = self.callbacks.clone();
        let latest = self.latest.clone();

        let handle = std::thread::Builder::new()
            .name("ps-refresh".into())
            .spawn(move || {
                let ticker = tick(interval);
                debug!("Started refresh timer");
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if paused.load(Ordering::SeqCst) {
                                continue;
                            }
                            let snapshot = client.snapshot();
                            *latest.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
                            callbacks.emit_event(&snapshot);
                        }
                    }
                }
                debug!("Stopped refresh timer");
            })
            .map_err(|e| PsError::Spawn(e.to_string()))?;

        *self.refresh.lock().unwrap_or_else(PoisonError::into_inner) = Some(RefreshJob {
            stop: stop_tx,
            handle,
        });
        Ok(())
    }

    /// Handle for issuing raw commands through the queue.
    pub fn client(&self) -> &CommandClient {
        &self.client
    }

    pub fn call(&self, supply: Supply, command: GenesysCommand) -> Result<String, PsError> {
        self.client.call(supply, command)
    }

    pub fn set_current(&self, supply: Supply, amps: f64) -> Result<(), PsError> {
        self.client
            .call(supply, GenesysCommand::SetCurrent(amps))
            .map(|_| ())
    }

    pub fn status(&self, supply: Supply) -> Result<PsStatus, PsError> {
        self.client.status(supply)
    }

    /// Poll both supplies now and publish the result.
    pub fn refresh(&self) -> PsSnapshot {
        let snapshot = self.client.snapshot();
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
        self.callbacks.emit_event(&snapshot);
        snapshot
    }

    /// Most recent published snapshot
    pub fn latest(&self) -> PsSnapshot {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_refresh_paused(&self) -> bool {
        self.refresh_paused.load(Ordering::SeqCst)
    }

    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&PsSnapshot) + Send + Sync + 'static,
    {
        self.callbacks.register_callback(callback)
    }

    pub fn deregister_callback(&self, callback_id: CallbackId) -> bool {
        self.callbacks.deregister_callback(callback_id)
    }

    fn stop_refresh(&self) {
        let job = self
            .refresh
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(job) = job {
            let _ = job.stop.send(());
            if job.handle.join().is_err() {
                warn!("Refresh thread panicked");
            }
        }
    }

    fn stop_worker(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = self.client.sender.send(Message::Stop);
            if worker.join().is_err() {
                warn!("Command worker panicked");
            }
        }
    }

    /// Stop refreshing, switch both outputs off and stop the worker.
    ///
    /// Queued commands ahead of the shutdown still run. Later calls fail with
    /// [`PsError::WorkerStopped`].
    pub fn shutdown(&self) {
        if self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
        {
            return;
        }
        self.stop_refresh();
        for supply in Supply::ALL {
            self.switch_output(supply, false);
        }
        self.stop_worker();
        info!("Power supply controller shut down");
    }
}

impl PowerSupplyControl for PsController {
    fn set_currents(&self, currents: [f64; 2]) -> Result<(), PsError> {
        self.set_current(Supply::Q1, currents[0])?;
        self.set_current(Supply::Q2, currents[1])
    }

    fn pause_refresh(&self) {
        debug!("Refresh paused");
        self.refresh_paused.store(true, Ordering::SeqCst);
    }

    fn resume_refresh(&self) {
        debug!("Refresh resumed");
        self.refresh_paused.store(false, Ordering::SeqCst);
    }
}

impl Drop for PsController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

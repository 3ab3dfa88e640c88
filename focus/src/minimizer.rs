//! Closed-loop search over the two quadrupole currents.
//!
//! Each objective evaluation applies the candidate currents, opens the
//! accumulation gate and blocks on the [`Rendezvous`] until the pipeline
//! delivers the next fitted ellipse. The cost is
//! `area^numerator / circularity^denominator`.
//!
//! A run ends normally, early through the [`CancellationToken`] (status 99),
//! or not at all when the bounds are inverted. After a normal or early end the
//! best currents are applied once more, unless the run was torn down with
//! [`Minimizer::force_shutdown`].

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use hardware::ps_controller::{PowerSupplyControl, PsError};
use shared::callback::{CallbackId, CallbackRegistry};
use shared::image_proc::DetectedEllipse;
use shared::settings::OptimizerSettings;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::nelder_mead::{self, Bounds, Cancelled, OptimizeError, OptimizeResult, Options};
use crate::rendezvous::{CancellationToken, Rendezvous};
use crate::stats::{EvaluationStats, StatsSnapshot};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MinimizerError {
    #[error(transparent)]
    Bounds(#[from] OptimizeError),

    #[error("failed to apply currents {currents:?}: {source}")]
    Device {
        currents: [f64; 2],
        #[source]
        source: PsError,
    },

    #[error("a minimization is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone)]
pub enum MinimizerEvent {
    Started {
        x0: [f64; 2],
        bounds: Bounds<2>,
    },
    CurrentsApplied([f64; 2]),
    /// Gate opened (true) or closed (false) for one evaluation
    Accumulating(bool),
    Evaluated {
        x: [f64; 2],
        cost: f64,
        ellipse: DetectedEllipse,
    },
    StatsUpdated(StatsSnapshot),
    Iteration {
        x: [f64; 2],
        fun: f64,
        nit: usize,
    },
    BoundsError(OptimizeError),
    Finished(OptimizeResult<2>),
}

/// Everything one run needs, resolved from settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MinimizerConfig {
    pub x0: [f64; 2],
    pub bounds: Bounds<2>,
    pub options: Options,
    /// (numerator, denominator) exponents of the cost
    pub powers: (i32, i32),
}

impl MinimizerConfig {
    /// Zero iteration or evaluation limits mean no limit.
    pub fn from_settings(settings: &OptimizerSettings) -> Self {
        let limit = |value: usize| (value != 0).then_some(value);
        Self {
            x0: settings.initial,
            bounds: Bounds::new(settings.bounds()),
            options: Options {
                xatol: settings.xatol(),
                fatol: settings.fatol(),
                maxiter: limit(settings.maxiter),
                maxfev: limit(settings.maxfev),
            },
            powers: settings.powers(),
        }
    }
}

/// `area^numerator / circularity^denominator`, NaN for a null ellipse.
pub fn objective_cost(ellipse: &DetectedEllipse, powers: (i32, i32)) -> f64 {
    let (numerator, denominator) = powers;
    ellipse.area().powi(numerator) / ellipse.circularity().powi(denominator)
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Minimizer {
    supplies: Arc<dyn PowerSupplyControl>,
    rendezvous: Arc<Rendezvous>,
    cancel: CancellationToken,
    forced: AtomicBool,
    running: AtomicBool,
    stats: Mutex<EvaluationStats>,
    events: Arc<CallbackRegistry<MinimizerEvent>>,
}

impl Minimizer {
    pub fn new(
        supplies: Arc<dyn PowerSupplyControl>,
        rendezvous: Arc<Rendezvous>,
        cancel: CancellationToken,
    ) -> Self {
        info!("Minimizer initialized");
        Self {
            supplies,
            rendezvous,
            cancel,
            forced: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stats: Mutex::new(EvaluationStats::new()),
            events: Arc::new(CallbackRegistry::new()),
        }
    }

    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&MinimizerEvent) + Send + Sync + 'static,
    {
        self.events.register_callback(callback)
    }

    pub fn deregister_callback(&self, callback_id: CallbackId) -> bool {
        self.events.deregister_callback(callback_id)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
    }

    /// Ask a running search to stop at the next evaluation or iteration.
    pub fn request_stop(&self) {
        info!("Minimization stop requested");
        self.cancel.cancel();
    }

    /// Stop for teardown: cancel, release a blocked evaluation and skip the
    /// final current update.
    pub fn force_shutdown(&self) {
        info!("Forcing minimizer shutdown");
        self.forced.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        self.rendezvous.force_release();
    }

    /// Run a search on a new thread.
    pub fn spawn(
        self: &Arc<Self>,
        config: MinimizerConfig,
    ) -> std::io::Result<JoinHandle<Result<OptimizeResult<2>, MinimizerError>>> {
        let minimizer = self.clone();
        std::thread::Builder::new()
            .name("minimizer".into())
            .spawn(move || minimizer.run(&config))
    }

    /// Run a search on the calling thread.
    pub fn run(&self, config: &MinimizerConfig) -> Result<OptimizeResult<2>, MinimizerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(MinimizerError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        if !self.forced.load(Ordering::SeqCst) {
            self.cancel.reset();
            self.rendezvous.reset();
        }
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();

        info!("Minimizer started");
        self.supplies.pause_refresh();
        self.rendezvous.disarm();
        self.events.emit_event(&MinimizerEvent::Started {
            x0: config.x0,
            bounds: config.bounds,
        });

        let mut device_error = None;
        let outcome = nelder_mead::minimize(
            |x| self.evaluate(x, config.powers, &mut device_error),
            config.x0,
            &config.bounds,
            &config.options,
            |iterate| {
                info!(
                    "Iteration {} ended, best so far: Q1 = {:.4} A, Q2 = {:.4} A, cost = {:.4}",
                    iterate.nit, iterate.x[0], iterate.x[1], iterate.fun
                );
                self.events.emit_event(&MinimizerEvent::Iteration {
                    x: iterate.x,
                    fun: iterate.fun,
                    nit: iterate.nit,
                });
                if self.cancel.is_cancelled() {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            },
        );
        self.rendezvous.disarm();

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                error!("Incorrect bounds: {e}");
                self.events.emit_event(&MinimizerEvent::BoundsError(e.clone()));
                self.supplies.resume_refresh();
                return Err(e.into());
            }
        };

        if let Some(e) = device_error {
            self.supplies.resume_refresh();
            self.events.emit_event(&MinimizerEvent::Finished(result));
            return Err(e);
        }

        if result.is_cancelled() {
            warn!("Early stopping after {} evaluations", result.nfev);
        }

        if self.forced.load(Ordering::SeqCst) {
            debug!("Forced shutdown, leaving currents as they are");
        } else if result.x.iter().all(|v| v.is_finite()) {
            info!(
                "Solution: Q1 = {:.4} A, Q2 = {:.4} A ({})",
                result.x[0], result.x[1], result.status
            );
            match self.supplies.set_currents(result.x) {
                Ok(()) => self
                    .events
                    .emit_event(&MinimizerEvent::CurrentsApplied(result.x)),
                Err(e) => error!("Failed to apply the solution: {e}"),
            }
        }

        self.supplies.resume_refresh();
        self.events.emit_event(&MinimizerEvent::Finished(result));
        info!("Minimization process finished");
        Ok(result)
    }

    fn evaluate(
        &self,
        x: &[f64; 2],
        powers: (i32, i32),
        device_error: &mut Option<MinimizerError>,
    ) -> Result<f64, Cancelled> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }

        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_currents(*x);
        info!(
            "Objective called with Q1 = {:.4} A, Q2 = {:.4} A",
            x[0], x[1]
        );

        if let Err(source) = self.supplies.set_currents(*x) {
            error!("Failed to set currents: {source}");
            *device_error = Some(MinimizerError::Device {
                currents: *x,
                source,
            });
            return Err(Cancelled);
        }
        self.events.emit_event(&MinimizerEvent::CurrentsApplied(*x));

        self.rendezvous.arm();
        self.events.emit_event(&MinimizerEvent::Accumulating(true));
        let ellipse = self.rendezvous.wait();
        self.rendezvous.disarm();
        self.events.emit_event(&MinimizerEvent::Accumulating(false));

        if self.forced.load(Ordering::SeqCst) {
            return Err(Cancelled);
        }

        let cost = objective_cost(&ellipse, powers);
        let snapshot = {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            stats.record_value(*x, cost);
            stats.snapshot()
        };
        self.events.emit_event(&MinimizerEvent::Evaluated {
            x: *x,
            cost,
            ellipse,
        });
        self.events.emit_event(&MinimizerEvent::StatsUpdated(snapshot));

        info!("Objective value: {cost:.2}");
        debug!(?snapshot, "Evaluation statistics");
        Ok(cost)
    }
}

//! Composition root for one focusing session.
//!
//! [`FocusSession`] owns the three threads of control: the camera thread
//! (sole writer of the [`AccumulationPipeline`]), the minimizer thread for the
//! duration of a run, and the power-supply command worker inside
//! [`PsController`]. Pipeline parameters change only through
//! [`PipelineCommand`]s, which the camera thread applies between frames.
//!
//! With image processing on, batches keep flowing to the pipeline observers
//! while no run is active. Only a batch started after the minimizer arms a
//! measurement is handed to it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use hardware::ps_controller::PsController;
use shared::callback::{CallbackId, CallbackRegistry};
use shared::camera_interface::CameraInterface;
use shared::frame_writer::FrameWriterHandle;
use shared::run_summary::RunSummary;
use shared::settings::{FocusSettings, RoiCorners};
use tracing::{debug, error, info, warn};

use crate::accumulation::{
    todays_run_directory, AccumulationError, AccumulationPipeline, FrameOutcome, PipelineEvent,
};
use crate::minimizer::{Minimizer, MinimizerConfig, MinimizerError, MinimizerEvent};
use crate::nelder_mead::OptimizeResult;
use crate::rendezvous::{CancellationToken, Rendezvous};

const WRITER_THREADS: usize = 2;
const WRITER_QUEUE: usize = 16;

/// Pipeline parameter changes, applied on the camera thread.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineCommand {
    SetBatchSize(usize),
    SetThreshold(i32),
    SetGaussian(bool),
    SetGaussianKernel(usize),
    SetRoi(Option<RoiCorners>),
    Stop,
}

type MinimizerHandle = JoinHandle<Result<OptimizeResult<2>, MinimizerError>>;

pub struct FocusSession {
    settings: FocusSettings,
    data_dir: PathBuf,
    supplies: Arc<PsController>,
    rendezvous: Arc<Rendezvous>,
    minimizer: Arc<Minimizer>,
    pipeline_events: Arc<CallbackRegistry<PipelineEvent>>,
    commands: Sender<PipelineCommand>,
    camera_thread: Option<JoinHandle<()>>,
    run: Mutex<Option<MinimizerHandle>>,
    summary: Arc<Mutex<RunSummary>>,
    shut_down: bool,
}

impl FocusSession {
    /// Connect the camera and start streaming into a new pipeline.
    ///
    /// `supplies` must already be connected. Batch images, when enabled, and
    /// summaries go below `data_dir`.
    pub fn start(
        settings: FocusSettings,
        mut camera: Box<dyn CameraInterface>,
        supplies: PsController,
        data_dir: &Path,
    ) -> Result<Self> {
        settings.validate().context("Invalid session settings")?;

        camera
            .connect()
            .with_context(|| format!("Failed to connect {}", camera.name()))?;
        camera
            .configure(&settings.camera)
            .context("Failed to configure camera")?;
        camera.start().context("Failed to start streaming")?;
        let (width, height) = camera.resolution();
        info!("{} streaming at {}x{}", camera.name(), width, height);

        let rendezvous = Arc::new(Rendezvous::new());
        rendezvous.set_processing(settings.accumulation.image_processing);
        let cancel = CancellationToken::new();

        let mut pipeline = AccumulationPipeline::new(&settings.accumulation, rendezvous.clone())
            .with_cancellation(cancel.clone());
        if settings.accumulation.save_images {
            let writer = FrameWriterHandle::new(WRITER_THREADS, WRITER_QUEUE)?;
            pipeline = pipeline.with_artifacts(todays_run_directory(data_dir), writer);
        }
        pipeline.set_roi(settings.roi);

        let summary = Arc::new(Mutex::new(RunSummary::new()));
        let pipeline_events = pipeline.events();
        {
            let summary = summary.clone();
            pipeline_events.register_callback(move |event| {
                if let PipelineEvent::Ellipse(ellipse) = event {
                    summary
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record_ellipse(ellipse);
                }
            });
        }

        let supplies = Arc::new(supplies);
        let minimizer = Arc::new(Minimizer::new(
            supplies.clone(),
            rendezvous.clone(),
            cancel,
        ));
        {
            let summary = summary.clone();
            minimizer.register_callback(move |event| {
                if let MinimizerEvent::Evaluated { x, cost, .. } = event {
                    summary
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .record_evaluation(*x, *cost);
                }
            });
        }

        let (commands, receiver) = unbounded();
        let camera_thread = std::thread::Builder::new()
            .name("camera".into())
            .spawn(move || camera_loop(camera, pipeline, receiver))
            .context("Failed to spawn camera thread")?;

        Ok(Self {
            settings,
            data_dir: data_dir.to_path_buf(),
            supplies,
            rendezvous,
            minimizer,
            pipeline_events,
            commands,
            camera_thread: Some(camera_thread),
            run: Mutex::new(None),
            summary,
            shut_down: false,
        })
    }

    pub fn settings(&self) -> &FocusSettings {
        &self.settings
    }

    pub fn power_supplies(&self) -> &PsController {
        &self.supplies
    }

    pub fn register_pipeline_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.pipeline_events.register_callback(callback)
    }

    pub fn register_minimizer_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&MinimizerEvent) + Send + Sync + 'static,
    {
        self.minimizer.register_callback(callback)
    }

    /// Process frames for display between measurements.
    pub fn set_image_processing(&self, enabled: bool) {
        info!(enabled, "Image processing toggled");
        self.rendezvous.set_processing(enabled);
    }

    pub fn is_image_processing(&self) -> bool {
        self.rendezvous.is_processing()
    }

    /// Queue a pipeline parameter change.
    pub fn send(&self, command: PipelineCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("Camera thread is not running"))
    }

    /// Start a run with the session's optimizer settings.
    pub fn start_minimization(&self) -> Result<()> {
        self.start_minimization_with(MinimizerConfig::from_settings(&self.settings.optimizer))
    }

    pub fn start_minimization_with(&self, config: MinimizerConfig) -> Result<()> {
        if self.shut_down {
            bail!("Session is shut down");
        }
        let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        if run.as_ref().is_some_and(|handle| !handle.is_finished()) {
            bail!(MinimizerError::AlreadyRunning);
        }
        if let Some(previous) = run.take() {
            log_run_outcome(previous);
        }

        self.summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        info!(
            "Starting minimization from Q1 = {:.3} A, Q2 = {:.3} A",
            config.x0[0], config.x0[1]
        );
        *run = Some(
            self.minimizer
                .spawn(config)
                .context("Failed to spawn minimizer thread")?,
        );
        Ok(())
    }

    pub fn is_minimizing(&self) -> bool {
        self.minimizer.is_running()
    }

    /// Ask the running search to stop early.
    pub fn stop_minimization(&self) {
        self.minimizer.request_stop();
    }

    /// Block until the current run ends.
    pub fn wait_for_minimization(&self) -> Result<OptimizeResult<2>> {
        let handle = self
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .context("No minimization was started")?;
        let outcome = handle
            .join()
            .map_err(|_| anyhow!("Minimizer thread panicked"))?;
        Ok(outcome?)
    }

    pub fn summary(&self) -> RunSummary {
        self.summary
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Write the run summary CSV under the data directory.
    pub fn save_summary(&self) -> Result<PathBuf> {
        let path = self.summary().save_now(&self.data_dir)?;
        info!("Run summary saved to {}", path.display());
        Ok(path)
    }

    /// Tear everything down without waiting for a measurement.
    ///
    /// A blocked evaluation is released with the null ellipse and the
    /// optimum is not re-applied; the supplies are then switched off.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!("Shutting down focusing session");

        self.minimizer.force_shutdown();
        if let Some(handle) = self
            .run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            log_run_outcome(handle);
        }

        // the thread may already have exited on a camera error
        let _ = self.commands.send(PipelineCommand::Stop);
        if let Some(handle) = self.camera_thread.take() {
            if handle.join().is_err() {
                error!("Camera thread panicked");
            }
        }

        self.supplies.shutdown();
        info!("Focusing session closed");
    }
}

impl Drop for FocusSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn log_run_outcome(handle: MinimizerHandle) {
    match handle.join() {
        Ok(Ok(result)) => debug!(status = result.status.code(), "Previous run ended"),
        Ok(Err(e)) => warn!("Previous run failed: {e}"),
        Err(_) => error!("Minimizer thread panicked"),
    }
}

fn apply_command(pipeline: &mut AccumulationPipeline, command: PipelineCommand) {
    match command {
        PipelineCommand::SetBatchSize(n) => pipeline.set_batch_size(n),
        PipelineCommand::SetThreshold(t) => pipeline.set_threshold(t),
        PipelineCommand::SetGaussian(on) => pipeline.set_gaussian_enabled(on),
        PipelineCommand::SetGaussianKernel(size) => {
            // rejected sizes are logged by the pipeline
            let _ = pipeline.set_gaussian_kernel(size);
        }
        PipelineCommand::SetRoi(roi) => pipeline.set_roi(roi),
        PipelineCommand::Stop => {}
    }
}

fn camera_loop(
    mut camera: Box<dyn CameraInterface>,
    mut pipeline: AccumulationPipeline,
    commands: Receiver<PipelineCommand>,
) {
    debug!("Camera thread started");
    'frames: loop {
        loop {
            match commands.try_recv() {
                Ok(PipelineCommand::Stop) | Err(TryRecvError::Disconnected) => break 'frames,
                Ok(command) => {
                    debug!(?command, "Applying pipeline command");
                    apply_command(&mut pipeline, command);
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        let frame = match camera.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Camera stream ended: {e}");
                break;
            }
        };

        match pipeline.submit_frame(&frame) {
            Ok(FrameOutcome::Batch(batch)) => {
                debug!(sequence = batch.sequence, "Batch finalized: {}", batch.ellipse)
            }
            Ok(_) => {}
            Err(AccumulationError::InvalidRegion(e)) => {
                warn!("{e}; clearing the region of interest");
                pipeline.set_roi(None);
            }
        }
    }

    if let Err(e) = camera.stop() {
        warn!("Failed to stop camera: {e}");
    }
    if let Err(e) = camera.disconnect() {
        warn!("Failed to disconnect camera: {e}");
    }
    pipeline.finish();
    debug!("Camera thread stopped");
}

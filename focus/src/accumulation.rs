//! Frame accumulation and beam-spot detection.
//!
//! [`AccumulationPipeline`] runs on the frame-delivery thread and is its only
//! writer. While the accumulation gate in the shared [`Rendezvous`] is open,
//! every frame is converted to grayscale, optionally cropped to the ROI and
//! summed into a floating-point accumulator. Every `batch_size` frames the sum
//! is reduced to one measurement:
//!
//! 1. mean image stretched to 8 bits, plus its histogram and row/column profiles
//! 2. optional Gaussian smoothing
//! 3. fixed or Otsu threshold
//! 4. external contours with area above [`MIN_CONTOUR_AREA`], fitted in
//!    ascending area order so the largest one's ellipse is kept
//!
//! A batch belongs to the measurement generation that was current at its
//! first frame. When the optimizer arms a new measurement the partial batch is
//! dropped, so every delivered ellipse is built only from frames taken after
//! the arm.
//!
//! A batch without a qualifying contour relaxes a fixed threshold by one for
//! the next batch. With automatic thresholding it is a terminal failure: the
//! null ellipse goes to the optimizer and a running search is cancelled.

use std::sync::Arc;

use chrono::Local;
use ndarray::{Array1, Array2, ArrayView2, Zip};
use shared::callback::{CallbackId, CallbackRegistry};
use shared::camera_interface::Frame;
use shared::frame_writer::{FrameWriterHandle, RunDirectory};
use shared::image_proc::{
    apply_threshold, column_profile, draw_ellipse, external_contours, fit_ellipse,
    gaussian_blur, intensity_histogram, normalize_min_max, peak_normalize, row_profile,
    DetectedEllipse, GaussianKernel, KernelSizeError, ThresholdMode,
};
use shared::settings::{AccumulationSettings, RoiCorners};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::rendezvous::{CancellationToken, Rendezvous};
use crate::roi::{InvalidRegionError, Roi};

/// Contours enclosing this many pixels or fewer are ignored.
pub const MIN_CONTOUR_AREA: f64 = 100.0;

/// Gray level and stroke width of fitted ellipses on the annotated image.
const OVERLAY_VALUE: u8 = 255;
const OVERLAY_THICKNESS: usize = 2;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AccumulationError {
    #[error("invalid region of interest: {0}")]
    InvalidRegion(#[from] InvalidRegionError),
}

/// Everything derived from one completed batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Sequence number of the batch within this pipeline
    pub sequence: u64,
    pub normalized: Arc<Array2<u8>>,
    /// Normalized image with the fitted ellipses drawn on it
    pub annotated: Arc<Array2<u8>>,
    pub histogram: Arc<Array1<f64>>,
    pub column_profile: Arc<Array1<f64>>,
    pub row_profile: Arc<Array1<f64>>,
    /// Threshold actually applied to the (smoothed) image
    pub applied_threshold: u8,
    pub ellipse: DetectedEllipse,
}

/// What happened to one submitted frame.
#[derive(Debug, Clone)]
pub enum FrameOutcome {
    /// Gate closed, frame not accumulated
    Skipped,
    /// Added to a batch that is still incomplete
    Accumulated { count: usize },
    /// Shape did not match the running batch, which was discarded
    Discarded,
    /// Completed a batch
    Batch(Box<BatchResult>),
}

/// Published to observers; cheap to clone.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Normalized(Arc<Array2<u8>>),
    Annotated(Arc<Array2<u8>>),
    Histogram(Arc<Array1<f64>>),
    Profiles {
        columns: Arc<Array1<f64>>,
        rows: Arc<Array1<f64>>,
    },
    Ellipse(DetectedEllipse),
    /// No spot found; the next batch uses this threshold
    ThresholdRelaxed { threshold: i32 },
    /// No spot found even with automatic thresholding
    DetectionFailed,
    RegionRejected(InvalidRegionError),
}

struct ArtifactSink {
    run: RunDirectory,
    writer: FrameWriterHandle,
}

pub struct AccumulationPipeline {
    batch_size: usize,
    threshold: i32,
    gaussian_enabled: bool,
    kernel: Option<GaussianKernel>,
    roi: Option<RoiCorners>,
    accumulator: Option<Array2<f64>>,
    accumulated: usize,
    batch_generation: u64,
    skipped: u64,
    batches: u64,
    rendezvous: Arc<Rendezvous>,
    cancel: Option<CancellationToken>,
    events: Arc<CallbackRegistry<PipelineEvent>>,
    artifacts: Option<ArtifactSink>,
}

impl AccumulationPipeline {
    pub fn new(settings: &AccumulationSettings, rendezvous: Arc<Rendezvous>) -> Self {
        let kernel = GaussianKernel::new(settings.gaussian_kernel)
            .inspect_err(|e| warn!("{e}, smoothing disabled until a valid size is set"))
            .ok();

        Self {
            batch_size: settings.images_to_accumulate.max(1),
            threshold: settings.threshold.clamp(-1, 255),
            gaussian_enabled: settings.gaussian_filter,
            kernel,
            roi: None,
            accumulator: None,
            accumulated: 0,
            batch_generation: 0,
            skipped: 0,
            batches: 0,
            rendezvous,
            cancel: None,
            events: Arc::new(CallbackRegistry::new()),
            artifacts: None,
        }
    }

    /// Cancel this token when detection fails terminally.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Persist the normalized and annotated image of every batch with a
    /// detected spot.
    pub fn with_artifacts(mut self, run: RunDirectory, writer: FrameWriterHandle) -> Self {
        info!("Saving batch images to {}", run.images_dir().display());
        self.artifacts = Some(ArtifactSink { run, writer });
        self
    }

    /// Shared registry for [`PipelineEvent`]s.
    pub fn events(&self) -> Arc<CallbackRegistry<PipelineEvent>> {
        self.events.clone()
    }

    pub fn register_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&PipelineEvent) + Send + Sync + 'static,
    {
        self.events.register_callback(callback)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Threshold for the next batch, -1 for automatic.
    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    pub fn accumulated_count(&self) -> usize {
        self.accumulated
    }

    pub fn skipped_count(&self) -> u64 {
        self.skipped
    }

    pub fn batches_completed(&self) -> u64 {
        self.batches
    }

    pub fn roi(&self) -> Option<RoiCorners> {
        self.roi
    }

    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size.max(1);
        self.reset_batch();
    }

    pub fn set_threshold(&mut self, threshold: i32) {
        self.threshold = threshold.clamp(-1, 255);
    }

    pub fn set_gaussian_enabled(&mut self, enabled: bool) {
        self.gaussian_enabled = enabled;
    }

    /// Change the smoothing kernel; an invalid size keeps the current one.
    pub fn set_gaussian_kernel(&mut self, size: usize) -> Result<(), KernelSizeError> {
        let kernel = GaussianKernel::new(size).inspect_err(|e| {
            warn!(
                current = ?self.kernel.as_ref().map(GaussianKernel::size),
                "{e}, keeping the current kernel"
            );
        })?;
        self.kernel = Some(kernel);
        Ok(())
    }

    /// Change or clear the ROI. Any partial batch is discarded.
    pub fn set_roi(&mut self, roi: Option<RoiCorners>) {
        self.roi = roi;
        self.reset_batch();
    }

    fn reset_batch(&mut self) {
        self.accumulated = 0;
        self.accumulator = None;
    }

    /// Feed one frame from the camera.
    ///
    /// An invalid ROI leaves the accumulator untouched and is returned so the
    /// caller can clear it. Every other problem is handled here.
    pub fn submit_frame(&mut self, frame: &Frame) -> Result<FrameOutcome, AccumulationError> {
        if !self.rendezvous.is_accumulating() {
            self.skipped += 1;
            return Ok(FrameOutcome::Skipped);
        }

        let gray = match frame.gray_view() {
            Some(view) => GrayFrame::Borrowed(view),
            None => GrayFrame::Owned(frame.to_grayscale()),
        };
        let full = gray.view();

        let active = match self.roi {
            Some(corners) => match Roi::from_corners(&corners).and_then(|roi| roi.crop(full)) {
                Ok(view) => view,
                Err(e) => {
                    error!("Rejected ROI: {e}");
                    self.events
                        .emit_event(&PipelineEvent::RegionRejected(e.clone()));
                    return Err(e.into());
                }
            },
            None => full,
        };

        let generation = self.rendezvous.generation();
        if self.accumulated > 0 && generation != self.batch_generation {
            debug!(
                dropped = self.accumulated,
                "New measurement armed, discarding the partial batch"
            );
            self.reset_batch();
        }
        if self.accumulated == 0 {
            self.accumulator = Some(Array2::zeros(active.dim()));
            self.batch_generation = generation;
        }

        let expected = self.accumulator.as_ref().map(|acc| acc.dim());
        let accumulator = match self.accumulator.as_mut() {
            Some(acc) if acc.dim() == active.dim() => acc,
            _ => {
                error!(
                    ?expected,
                    got = ?active.dim(),
                    "Frame shape does not match the running batch, discarding it"
                );
                self.reset_batch();
                return Ok(FrameOutcome::Discarded);
            }
        };

        Zip::from(accumulator)
            .and(&active)
            .for_each(|sum, &px| *sum += f64::from(px));
        self.accumulated += 1;

        if self.accumulated % self.batch_size != 0 {
            return Ok(FrameOutcome::Accumulated {
                count: self.accumulated,
            });
        }

        let frames = self.accumulated;
        let sum = self
            .accumulator
            .take()
            .unwrap_or_else(|| Array2::zeros(active.dim()));
        let batch = self.finalize_batch(sum, frames);
        self.reset_batch();
        Ok(FrameOutcome::Batch(Box::new(batch)))
    }

    fn finalize_batch(&mut self, sum: Array2<f64>, frames: usize) -> BatchResult {
        let sequence = self.batches;
        self.batches += 1;

        let columns = Arc::new(peak_normalize(&column_profile(&sum.view()).view()));
        let rows = Arc::new(peak_normalize(&row_profile(&sum.view()).view()));

        let mean = sum / frames as f64;
        let normalized = normalize_min_max(&mean.view());
        let histogram = Arc::new(intensity_histogram(&normalized.view()));

        let measure_input = match (&self.kernel, self.gaussian_enabled) {
            (Some(kernel), true) => gaussian_blur(&normalized.view(), kernel),
            _ => normalized.clone(),
        };

        let mode = ThresholdMode::from_setting(self.threshold).unwrap_or(ThresholdMode::Otsu);
        let (binary, applied_threshold) = apply_threshold(&measure_input.view(), mode);
        debug!(sequence, ?mode, applied_threshold, "Binarized batch image");

        let mut contours: Vec<_> = external_contours(&binary.view())
            .into_iter()
            .filter(|c| c.area() > MIN_CONTOUR_AREA)
            .collect();
        contours.sort_by(|a, b| a.area().total_cmp(&b.area()));

        let mut annotated = normalized.clone();
        let mut ellipse = DetectedEllipse::null();
        for contour in &contours {
            let Some(fit) = fit_ellipse(contour.points()) else {
                debug!(area = contour.area(), "Ellipse fit failed for contour");
                continue;
            };
            ellipse = DetectedEllipse::new(
                fit.center_x,
                fit.center_y,
                fit.minor,
                fit.major,
                fit.angle,
            );
            draw_ellipse(&mut annotated, &ellipse, OVERLAY_VALUE, OVERLAY_THICKNESS);
        }

        let normalized = Arc::new(normalized);
        let annotated = Arc::new(annotated);

        self.events
            .emit_event(&PipelineEvent::Normalized(normalized.clone()));
        self.events
            .emit_event(&PipelineEvent::Annotated(annotated.clone()));
        self.events
            .emit_event(&PipelineEvent::Histogram(histogram.clone()));
        self.events.emit_event(&PipelineEvent::Profiles {
            columns: columns.clone(),
            rows: rows.clone(),
        });

        if ellipse.is_null() {
            self.handle_detection_failure();
        } else {
            info!("Batch {sequence}: {ellipse}");
            self.save_artifacts(&normalized, &annotated);
            self.events.emit_event(&PipelineEvent::Ellipse(ellipse));
            self.rendezvous.deliver(self.batch_generation, ellipse);
        }

        BatchResult {
            sequence,
            normalized,
            annotated,
            histogram,
            column_profile: columns,
            row_profile: rows,
            applied_threshold,
            ellipse,
        }
    }

    fn handle_detection_failure(&mut self) {
        if self.threshold > -1 {
            self.threshold -= 1;
            warn!(
                threshold = self.threshold,
                "No beam spot found, relaxing the threshold for the next batch"
            );
            self.events.emit_event(&PipelineEvent::ThresholdRelaxed {
                threshold: self.threshold,
            });
            return;
        }

        error!("No beam spot found with automatic thresholding");
        self.events
            .emit_event(&PipelineEvent::Ellipse(DetectedEllipse::null()));
        self.events.emit_event(&PipelineEvent::DetectionFailed);
        if !self.rendezvous.is_armed_for(self.batch_generation) {
            return;
        }
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
        self.rendezvous
            .deliver(self.batch_generation, DetectedEllipse::null());
    }

    fn save_artifacts(&mut self, normalized: &Array2<u8>, annotated: &Array2<u8>) {
        let Some(sink) = self.artifacts.as_mut() else {
            return;
        };
        if let Err(e) = std::fs::create_dir_all(sink.run.images_dir()) {
            warn!(
                "Failed to create {}: {e}",
                sink.run.images_dir().display()
            );
            return;
        }
        let (normalized_path, processed_path) = sink.run.next_image_paths();
        for (image, path) in [(normalized, normalized_path), (annotated, processed_path)] {
            if let Err(e) = sink.writer.write_u8_frame(image, path) {
                warn!("Dropped batch image: {e:#}");
            }
        }
    }

    /// Flush pending image writes. Used at shutdown.
    pub fn finish(self) {
        if let Some(sink) = self.artifacts {
            sink.writer.wait_for_completion();
        }
    }
}

/// Single-channel view of a frame without copying gray input.
enum GrayFrame<'a> {
    Borrowed(ArrayView2<'a, u8>),
    Owned(Array2<u8>),
}

impl GrayFrame<'_> {
    fn view(&self) -> ArrayView2<'_, u8> {
        match self {
            GrayFrame::Borrowed(view) => view.view(),
            GrayFrame::Owned(array) => array.view(),
        }
    }
}

/// Allocate today's run directory under `data_dir`.
pub fn todays_run_directory(data_dir: &std::path::Path) -> RunDirectory {
    RunDirectory::allocate(data_dir, Local::now().date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use shared::settings::Point;
    use std::sync::Mutex;

    fn spot_frame(width: usize, height: usize, cx: f64, cy: f64, radius: f64) -> Frame {
        Frame::from_gray(Array2::from_shape_fn((height, width), |(y, x)| {
            let r2 = (x as f64 - cx).powi(2) + (y as f64 - cy).powi(2);
            if r2 <= radius * radius {
                220
            } else {
                10
            }
        }))
    }

    fn pipeline(batch_size: usize, threshold: i32) -> (AccumulationPipeline, Arc<Rendezvous>) {
        let rendezvous = Arc::new(Rendezvous::new());
        rendezvous.set_processing(true);
        let settings = AccumulationSettings {
            images_to_accumulate: batch_size,
            threshold,
            ..Default::default()
        };
        (AccumulationPipeline::new(&settings, rendezvous.clone()), rendezvous)
    }

    fn record_events(pipeline: &AccumulationPipeline) -> Arc<Mutex<Vec<PipelineEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        pipeline.register_callback(move |event| sink.lock().unwrap().push(event.clone()));
        events
    }

    #[test]
    fn test_closed_gate_skips_frames() {
        let (mut pipeline, rendezvous) = pipeline(5, -1);
        rendezvous.set_processing(false);
        let frame = spot_frame(64, 48, 32.0, 24.0, 10.0);

        assert!(matches!(
            pipeline.submit_frame(&frame).unwrap(),
            FrameOutcome::Skipped
        ));
        assert_eq!(pipeline.skipped_count(), 1);
        assert_eq!(pipeline.accumulated_count(), 0);
    }

    #[test]
    fn test_batch_completes_after_n_frames() {
        let (mut pipeline, _) = pipeline(5, -1);
        let frame = spot_frame(64, 48, 30.0, 20.0, 10.0);

        for i in 1..5 {
            match pipeline.submit_frame(&frame).unwrap() {
                FrameOutcome::Accumulated { count } => assert_eq!(count, i),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(pipeline.batches_completed(), 0);

        let FrameOutcome::Batch(batch) = pipeline.submit_frame(&frame).unwrap() else {
            panic!("expected a batch");
        };
        assert_eq!(pipeline.accumulated_count(), 0);
        assert_eq!(pipeline.batches_completed(), 1);
        assert_eq!(batch.sequence, 0);

        assert!(!batch.ellipse.is_null());
        assert_relative_eq!(batch.ellipse.x_c(), 30.0, epsilon = 0.75);
        assert_relative_eq!(batch.ellipse.y_c(), 20.0, epsilon = 0.75);
        assert_relative_eq!(batch.ellipse.major(), 20.0, epsilon = 2.0);
        assert_eq!(batch.histogram.len(), 256);
        assert_eq!(batch.column_profile.len(), 64);
        assert_eq!(batch.row_profile.len(), 48);
        assert_relative_eq!(
            batch.column_profile.iter().cloned().fold(f64::MIN, f64::max),
            1.0
        );
    }

    #[test]
    fn test_batch_delivers_to_rendezvous() {
        let (mut pipeline, rendezvous) = pipeline(2, -1);
        rendezvous.arm();
        let frame = spot_frame(64, 48, 32.0, 24.0, 12.0);
        pipeline.submit_frame(&frame).unwrap();
        pipeline.submit_frame(&frame).unwrap();

        let ellipse = rendezvous
            .wait_timeout(std::time::Duration::from_millis(100))
            .unwrap();
        assert_relative_eq!(ellipse.x_c(), 32.0, epsilon = 0.75);
    }

    #[test]
    fn test_new_arm_discards_partial_batch() {
        let (mut pipeline, rendezvous) = pipeline(3, -1);
        let before = spot_frame(64, 48, 20.0, 24.0, 10.0);
        let after = spot_frame(64, 48, 44.0, 24.0, 10.0);

        rendezvous.arm();
        for _ in 0..3 {
            pipeline.submit_frame(&before).unwrap();
        }
        assert_relative_eq!(rendezvous.wait().x_c(), 20.0, epsilon = 0.75);

        // the gate stays open for display, so this frame starts a new batch
        assert!(matches!(
            pipeline.submit_frame(&before).unwrap(),
            FrameOutcome::Accumulated { count: 1 }
        ));

        rendezvous.arm();
        assert!(matches!(
            pipeline.submit_frame(&after).unwrap(),
            FrameOutcome::Accumulated { count: 1 }
        ));
        pipeline.submit_frame(&after).unwrap();
        let FrameOutcome::Batch(batch) = pipeline.submit_frame(&after).unwrap() else {
            panic!("expected a batch");
        };
        assert_relative_eq!(batch.ellipse.x_c(), 44.0, epsilon = 0.75);
        assert_eq!(rendezvous.wait(), batch.ellipse);
    }

    #[test]
    fn test_gate_closes_after_delivery_without_processing() {
        let (mut pipeline, rendezvous) = pipeline(2, -1);
        rendezvous.set_processing(false);
        let frame = spot_frame(64, 48, 32.0, 24.0, 10.0);

        rendezvous.arm();
        pipeline.submit_frame(&frame).unwrap();
        pipeline.submit_frame(&frame).unwrap();
        assert!(!rendezvous.wait().is_null());

        assert!(matches!(
            pipeline.submit_frame(&frame).unwrap(),
            FrameOutcome::Skipped
        ));
        assert_eq!(pipeline.accumulated_count(), 0);
    }

    #[test]
    fn test_idle_batches_update_observers_only() {
        let (pipeline, rendezvous) = pipeline(2, -1);
        let cancel = CancellationToken::new();
        let mut pipeline = pipeline.with_cancellation(cancel.clone());
        let events = record_events(&pipeline);

        let frame = spot_frame(64, 48, 32.0, 24.0, 10.0);
        pipeline.submit_frame(&frame).unwrap();
        assert!(matches!(
            pipeline.submit_frame(&frame).unwrap(),
            FrameOutcome::Batch(_)
        ));
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, PipelineEvent::Ellipse(ellipse) if !ellipse.is_null())));
        assert!(rendezvous
            .wait_timeout(std::time::Duration::from_millis(10))
            .is_none());

        // a failed idle batch does not cancel the next run
        let blank = Frame::from_gray(Array2::from_elem((48, 64), 50));
        pipeline.submit_frame(&blank).unwrap();
        pipeline.submit_frame(&blank).unwrap();
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, PipelineEvent::DetectionFailed)));
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn test_only_detected_batches_are_saved() {
        let temp_dir = tempfile::tempdir().unwrap();
        let run = todays_run_directory(temp_dir.path());
        let images_dir = run.images_dir().to_path_buf();
        let writer = FrameWriterHandle::new(1, 4).unwrap();
        let (pipeline, _) = pipeline(1, -1);
        let mut pipeline = pipeline.with_artifacts(run, writer);

        let blank = Frame::from_gray(Array2::from_elem((48, 64), 50));
        let FrameOutcome::Batch(failed) = pipeline.submit_frame(&blank).unwrap() else {
            panic!("expected a batch");
        };
        assert!(failed.ellipse.is_null());
        assert!(!images_dir.exists());

        pipeline
            .submit_frame(&spot_frame(64, 48, 32.0, 24.0, 10.0))
            .unwrap();
        pipeline.finish();

        let mut names: Vec<String> = std::fs::read_dir(&images_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("Image_normalized_") && names[0].ends_with("_000.png"));
        assert!(names[1].starts_with("Image_processed_") && names[1].ends_with("_000.png"));
    }

    #[test]
    fn test_degenerate_roi_leaves_accumulator_untouched() {
        let (mut pipeline, _) = pipeline(5, -1);
        let events = record_events(&pipeline);
        let frame = spot_frame(64, 48, 32.0, 24.0, 10.0);

        pipeline.submit_frame(&frame).unwrap();
        pipeline.submit_frame(&frame).unwrap();
        pipeline.roi = Some(RoiCorners::new(Point::new(10, 10), Point::new(10, 40)));

        let err = pipeline.submit_frame(&frame).unwrap_err();
        assert!(matches!(
            err,
            AccumulationError::InvalidRegion(InvalidRegionError::Degenerate { .. })
        ));
        assert_eq!(pipeline.accumulated_count(), 2);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, PipelineEvent::RegionRejected(_))));
    }

    #[test]
    fn test_roi_crops_and_restarts_batch() {
        let (mut pipeline, _) = pipeline(2, -1);
        let frame = spot_frame(100, 80, 60.0, 40.0, 10.0);
        pipeline.submit_frame(&frame).unwrap();

        pipeline.set_roi(Some(RoiCorners::new(Point::new(80, 70), Point::new(30, 10))));
        assert_eq!(pipeline.accumulated_count(), 0);

        pipeline.submit_frame(&frame).unwrap();
        let FrameOutcome::Batch(batch) = pipeline.submit_frame(&frame).unwrap() else {
            panic!("expected a batch");
        };
        assert_eq!(batch.normalized.dim(), (60, 50));
        // coordinates are relative to the ROI
        assert_relative_eq!(batch.ellipse.x_c(), 30.0, epsilon = 0.75);
        assert_relative_eq!(batch.ellipse.y_c(), 30.0, epsilon = 0.75);
    }

    #[test]
    fn test_shape_mismatch_discards_batch() {
        let (mut pipeline, _) = pipeline(3, -1);
        let events = record_events(&pipeline);
        pipeline
            .submit_frame(&spot_frame(64, 48, 32.0, 24.0, 10.0))
            .unwrap();
        pipeline
            .submit_frame(&spot_frame(64, 48, 32.0, 24.0, 10.0))
            .unwrap();

        let outcome = pipeline
            .submit_frame(&spot_frame(80, 48, 32.0, 24.0, 10.0))
            .unwrap();
        assert!(matches!(outcome, FrameOutcome::Discarded));
        assert_eq!(pipeline.accumulated_count(), 0);
        assert_eq!(pipeline.batches_completed(), 0);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failed_detection_relaxes_fixed_threshold() {
        let (mut pipeline, rendezvous) = pipeline(1, 5);
        rendezvous.arm();
        let events = record_events(&pipeline);
        let blank = Frame::from_gray(Array2::from_elem((32, 32), 50));

        let FrameOutcome::Batch(batch) = pipeline.submit_frame(&blank).unwrap() else {
            panic!("expected a batch");
        };
        assert!(batch.ellipse.is_null());
        assert_eq!(batch.applied_threshold, 5);
        assert_eq!(pipeline.threshold(), 4);
        assert_eq!(pipeline.accumulated_count(), 0);
        // optimizer keeps waiting
        assert!(rendezvous
            .wait_timeout(std::time::Duration::from_millis(10))
            .is_none());
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, PipelineEvent::ThresholdRelaxed { threshold: 4 })));
    }

    #[test]
    fn test_failed_automatic_detection_is_terminal() {
        let (pipeline, rendezvous) = pipeline(1, 0);
        let cancel = CancellationToken::new();
        let mut pipeline = pipeline.with_cancellation(cancel.clone());
        let events = record_events(&pipeline);
        let blank = Frame::from_gray(Array2::from_elem((32, 32), 50));

        rendezvous.arm();
        pipeline.submit_frame(&blank).unwrap();
        assert_eq!(pipeline.threshold(), -1);
        assert!(!cancel.is_cancelled());

        pipeline.submit_frame(&blank).unwrap();
        assert_eq!(pipeline.threshold(), -1);
        assert!(cancel.is_cancelled());
        let delivered = rendezvous
            .wait_timeout(std::time::Duration::from_millis(10))
            .unwrap();
        assert!(delivered.is_null());
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, PipelineEvent::DetectionFailed)));
    }

    #[test]
    fn test_largest_contour_wins() {
        let (mut pipeline, _) = pipeline(1, 100);
        let frame = Frame::from_gray(Array2::from_shape_fn((120, 160), |(y, x)| {
            let small = (x as f64 - 30.0).powi(2) + (y as f64 - 30.0).powi(2) <= 64.0;
            let large = (x as f64 - 110.0).powi(2) + (y as f64 - 70.0).powi(2) <= 400.0;
            if small || large {
                200
            } else {
                0
            }
        }));

        let FrameOutcome::Batch(batch) = pipeline.submit_frame(&frame).unwrap() else {
            panic!("expected a batch");
        };
        assert_relative_eq!(batch.ellipse.x_c(), 110.0, epsilon = 0.75);
        assert_relative_eq!(batch.ellipse.y_c(), 70.0, epsilon = 0.75);
        // the smaller spot is outlined too
        let outlined = (15..45).any(|y| {
            (15..45).any(|x| {
                batch.normalized[[y, x]] == 0 && batch.annotated[[y, x]] == OVERLAY_VALUE
            })
        });
        assert!(outlined);
    }

    #[test]
    fn test_even_kernel_rejected() {
        let (mut pipeline, _) = pipeline(1, -1);
        assert_eq!(pipeline.set_gaussian_kernel(4), Err(KernelSizeError(4)));
        assert!(pipeline.set_gaussian_kernel(5).is_ok());
    }

    #[test]
    fn test_color_frames_are_converted() {
        let (mut pipeline, _) = pipeline(1, -1);
        let gray = spot_frame(64, 48, 20.0, 30.0, 9.0);
        let pixels = gray.pixels();
        let bgr = ndarray::Array3::from_shape_fn((48, 64, 3), |(y, x, _)| pixels[[y, x, 0]]);
        let frame = Frame::new(bgr).unwrap();

        let FrameOutcome::Batch(batch) = pipeline.submit_frame(&frame).unwrap() else {
            panic!("expected a batch");
        };
        assert_relative_eq!(batch.ellipse.x_c(), 20.0, epsilon = 0.75);
    }
}

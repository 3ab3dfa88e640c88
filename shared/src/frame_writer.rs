//! Asynchronous artifact writer with worker thread pool.
//!
//! Batch images are handed to a bounded channel and encoded to PNG by worker
//! threads so the frame-delivery thread never blocks on disk I/O.
//! [`RunDirectory`] decides where each batch's images go.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use crossbeam_channel::{bounded, Sender, TrySendError};
use ndarray::Array2;
use std::mem;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tracing::{info, warn};

use crate::image_proc::array2_to_gray_image;

pub struct FrameWriterHandle {
    sender: Sender<FrameWriteTask>,
    workers: Vec<JoinHandle<()>>,
}

struct FrameWriteTask {
    frame: Array2<u8>,
    filepath: PathBuf,
}

impl FrameWriterHandle {
    pub fn new(num_workers: usize, buffer_size: usize) -> Result<Self> {
        let (sender, receiver) = bounded::<FrameWriteTask>(buffer_size);

        let mut workers = Vec::new();
        for worker_id in 0..num_workers.max(1) {
            let receiver = receiver.clone();

            let handle = std::thread::Builder::new()
                .name(format!("frame-writer-{worker_id}"))
                .spawn(move || {
                    info!("Frame writer worker {} started", worker_id);
                    while let Ok(task) = receiver.recv() {
                        match save_png(&task.frame, &task.filepath) {
                            Ok(()) => info!("Saved image: {}", task.filepath.display()),
                            Err(e) => warn!(
                                "Worker {} failed to save frame to {}: {:#}",
                                worker_id,
                                task.filepath.display(),
                                e
                            ),
                        }
                    }
                    info!("Frame writer worker {} shutting down", worker_id);
                })
                .context("Failed to spawn frame writer worker")?;

            workers.push(handle);
        }

        Ok(Self { sender, workers })
    }

    /// Queue an 8-bit image for writing as PNG; fails if the queue is full.
    pub fn write_u8_frame(&self, frame_data: &Array2<u8>, filepath: PathBuf) -> Result<()> {
        let task = FrameWriteTask {
            frame: frame_data.clone(),
            filepath,
        };

        match self.sender.try_send(task) {
            Ok(_) => Ok(()),
            Err(TrySendError::Full(task)) => {
                anyhow::bail!(
                    "Frame writer queue full, cannot write to {}",
                    task.filepath.display()
                )
            }
            Err(TrySendError::Disconnected(_)) => {
                anyhow::bail!("Frame writer workers have shut down")
            }
        }
    }

    /// Close the queue and wait for every pending image to be written.
    pub fn wait_for_completion(mut self) {
        mem::drop(self.sender);

        for (worker_id, handle) in self.workers.drain(..).enumerate() {
            if let Err(e) = handle.join() {
                warn!("Worker {} panicked: {:?}", worker_id, e);
            }
        }

        info!("All frame writer workers completed");
    }
}

fn save_png(frame: &Array2<u8>, filepath: &Path) -> Result<()> {
    if let Some(parent) = filepath.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    array2_to_gray_image(&frame.view())
        .save(filepath)
        .with_context(|| format!("Failed to encode PNG: {}", filepath.display()))?;
    Ok(())
}

/// Per-run artifact location: `<data_dir>/<date>/run_<NN>/images`.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    date: NaiveDate,
    run_index: u32,
    images_dir: PathBuf,
    next_image: u32,
}

impl RunDirectory {
    /// Pick the next free run index under `<data_dir>/<date>`.
    ///
    /// The index is one past the highest existing `run_NN` folder, or 0. No
    /// directory is created until the first image is written.
    pub fn allocate(data_dir: &Path, date: NaiveDate) -> Self {
        let date_dir = data_dir.join(date.format("%Y-%m-%d").to_string());
        let run_index = last_run_index(&date_dir).map_or(0, |last| last + 1);
        let images_dir = date_dir.join(format!("run_{run_index:02}")).join("images");

        Self {
            date,
            run_index,
            images_dir,
            next_image: 0,
        }
    }

    pub fn run_index(&self) -> u32 {
        self.run_index
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// File paths for the next batch: (normalized, processed).
    pub fn next_image_paths(&mut self) -> (PathBuf, PathBuf) {
        let date = self.date.format("%Y-%m-%d");
        let n = self.next_image;
        self.next_image += 1;
        (
            self.images_dir
                .join(format!("Image_normalized_{date}_{n:03}.png")),
            self.images_dir
                .join(format!("Image_processed_{date}_{n:03}.png")),
        )
    }
}

fn last_run_index(date_dir: &Path) -> Option<u32> {
    let entries = std::fs::read_dir(date_dir).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("run_"))
                .and_then(|n| n.parse::<u32>().ok())
        })
        .max()
}

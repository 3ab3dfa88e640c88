//! Closed-loop beam focusing.
//!
//! Frames from a camera are summed by the [`accumulation`] pipeline into one
//! ellipse measurement per batch. The [`minimizer`] drives a bounded
//! [`nelder_mead`] search over the two quadrupole currents and blocks on the
//! [`rendezvous`] for each measurement. [`session::FocusSession`] wires these
//! to the camera and the power supplies.

pub mod accumulation;
pub mod minimizer;
pub mod nelder_mead;
pub mod rendezvous;
pub mod roi;
pub mod session;
pub mod simulation;
pub mod stats;

pub use accumulation::{AccumulationPipeline, BatchResult, FrameOutcome, PipelineEvent};
pub use minimizer::{Minimizer, MinimizerConfig, MinimizerError, MinimizerEvent};
pub use nelder_mead::{Bounds, OptimizeResult, Options, Status};
pub use rendezvous::{CancellationToken, Rendezvous};
pub use session::{FocusSession, PipelineCommand};

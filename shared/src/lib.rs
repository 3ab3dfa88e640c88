//! Shared components for the beam focusing workspace.
//!
//! This crate holds the value types, image processing and persistence helpers
//! that are used by both the hardware drivers and the focusing engine, so the
//! higher level crates agree on frame layout, ellipse geometry and settings.

pub mod callback;
pub mod camera_interface;
pub mod config_storage;
pub mod frame_writer;
pub mod image_proc;
pub mod run_summary;
pub mod settings;

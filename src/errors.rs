//! Error Types
//!
//! This module defines the error types used throughout the rendering core.
//!
//! # Overview
//!
//! The main error type [`ArgusError`] covers the recoverable failure modes:
//! - Pipeline and shader creation failures
//! - Memory exhaustion that survives the allocator's grow-once retry
//! - Device removal (TDR) detected at the frame fence
//!
//! Programming errors — double-writing a resource in one pass, exceeding the
//! meshlet/instance caps, exporting two resources into one slot — are
//! assertion failures, not `Result`s. They indicate a bug in the caller and
//! have no runtime recovery.

use thiserror::Error;

/// The main error type for the rendering core.
#[derive(Error, Debug)]
pub enum ArgusError {
    // ========================================================================
    // Pipeline Errors
    // ========================================================================
    /// Shader or pipeline state creation failed.
    #[error("Pipeline creation failed for '{name}': {reason}")]
    PipelineCreation {
        /// Debug name of the pipeline.
        name: String,
        /// Compiler / validation output.
        reason: String,
    },

    // ========================================================================
    // Memory Errors
    // ========================================================================
    /// A placed-resource allocation failed even after creating a fresh heap.
    #[error("Out of device memory allocating '{name}' ({size} bytes)")]
    OutOfMemory {
        /// Debug name of the resource.
        name: String,
        /// Requested allocation size in bytes.
        size: u64,
    },

    // ========================================================================
    // Device Errors
    // ========================================================================
    /// The device was lost (TDR). Detected at the frame fence wait.
    #[error("Device removed: {0}")]
    DeviceLost(String),
}

/// Alias for `Result<T, ArgusError>`.
pub type Result<T> = std::result::Result<T, ArgusError>;

//! Error types shared across the crate
//!
//! Initialization failures are unrecoverable for the device being created;
//! per-operation failures (allocation, mapping, submission) are reported to
//! the immediate caller, which decides whether to retry with different
//! parameters.

use ash::vk;
use thiserror::Error;

/// Vulkan-specific error types
#[derive(Error, Debug)]
pub enum VulkanError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Device or instance initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// No physical device passed the suitability check
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },
}

/// Result type for Vulkan operations
pub type VulkanResult<T> = Result<T, VulkanError>;

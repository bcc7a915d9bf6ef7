// DSA Memory Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for the offload engine.

use thiserror::Error;

/// Errors that can occur while probing devices or running offloaded
/// operations. All of them are recovered inside the engine by the CPU
/// fallback; they surface only through logs and
/// [`Container::current_status`](crate::Container::current_status).
#[derive(Debug, Error)]
pub enum DsaError {
    /// No device available for dispatch.
    #[error("no DSA device found")]
    NoDeviceFound,

    /// No usable work queue on the device.
    #[error("no usable work queue")]
    NoWorkQueue,

    /// Operation completed with a hardware error status.
    #[error("DSA operation failed: status={status:#04x}, result={result:#04x}")]
    OperationFailed { status: u8, result: u8 },

    /// The completion record was not written within the wait budget.
    #[error("timed out waiting for completion record")]
    WaitTimeout,

    /// Transfer does not fit the descriptor's 32-bit size field.
    #[error("transfer of {0} bytes exceeds the descriptor size field")]
    TransferTooLarge(usize),

    /// The completion-record alignment advertised by the device exceeds
    /// what this engine allocates.
    #[error("unsupported completion record alignment: {0}")]
    UnsupportedComplAlign(usize),

    /// Malformed sysfs attribute.
    #[error("invalid sysfs value: {0}")]
    InvalidSysfs(String),

    /// I/O error from system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Permission denied accessing a work-queue device file.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Memory mapping of a portal failed.
    #[error("mmap failed: {0}")]
    MmapFailed(String),

    /// Platform has no accel-config surface (non-Linux, or IDXD absent).
    #[error("platform not supported: DSA requires Linux with the IDXD driver")]
    PlatformNotSupported,
}

/// Result type alias for engine-internal operations.
pub type DsaResult<T> = Result<T, DsaError>;

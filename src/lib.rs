// DSA Memory Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! # DSA Memory Offload Engine
//!
//! Transparent offload of bulk memory operations to Intel's Data
//! Streaming Accelerator (DSA), available on Intel Xeon Scalable
//! processors (4th Gen "Sapphire Rapids" and later).
//!
//! The crate provides drop-in replacements for the bulk memory
//! primitives — copy, move, set, compare — with identical semantics.
//! For sufficiently large transfers the work is performed by a
//! NUMA-local accelerator; when no accelerator is present, configured,
//! or healthy, the primitives degrade to the plain CPU implementations.
//! Callers never observe the difference.
//!
//! ## How it works
//!
//! A shim macro records per-call-site telemetry and forwards to the
//! process-wide [`Container`]. The container resolves the destination
//! buffer's NUMA node, picks the device indexed there, and the device
//! submits one 64-byte descriptor to a memory-mapped work-queue portal
//! via MOVDIR64B, then waits (UMONITOR/UMWAIT with a timestamp-counter
//! deadline) for the completion record. Device-reported page faults are
//! resolved by touching the faulting page and resubmitting at the
//! offset the device reached.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dsa_offload::{dsa_memcpy, Container};
//!
//! let engine = Container::global();
//! engine.initialize();
//!
//! let src = vec![1u8; 1 << 20];
//! let mut dst = vec![0u8; 1 << 20];
//! unsafe {
//!     dsa_memcpy!(dst.as_mut_ptr(), src.as_ptr(), src.len());
//! }
//! ```
//!
//! ## Requirements
//!
//! ### Hardware path
//! - Intel Xeon Scalable 4th Gen (Sapphire Rapids) or later
//! - Linux kernel 5.11+ with the IDXD driver, devices configured via
//!   `accel-config` with user work queues enabled
//!
//! ### Everywhere else
//! - No configuration required; all primitives run on the CPU. The
//!   `emulate` feature additionally executes descriptors in software so
//!   the device layer itself can be exercised without hardware.

// Module declarations
pub mod accfg;
pub mod container;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod numa;
pub mod opcode;
pub mod shims;
pub mod submit;
pub mod telemetry;

// Re-exports for convenient access
pub use accfg::{AccfgCtx, AccfgDevice};
pub use container::{Config, Container, Status};
pub use descriptor::{CompletionStatus, DescriptorFlags, DsaCompletionRecord, DsaHwDesc};
pub use device::Device;
pub use error::{DsaError, DsaResult};
pub use opcode::DsaOpcode;
pub use submit::WaitOutcome;
pub use telemetry::{CallSite, PrimitiveKind, Telemetry, TELEMETRY_MIN_SIZE};

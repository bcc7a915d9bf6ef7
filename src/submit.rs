// DSA Memory Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Low-level descriptor submission and completion waiting.
//!
//! This module isolates the four machine-specific primitives: the
//! MOVDIR64B 64-byte direct store, the UMONITOR/UMWAIT pair, and the
//! timestamp counter. Two implementations exist, selected at compile
//! time:
//!
//! - **hardware** (x86_64, default): real instructions against a mapped
//!   work-queue portal.
//! - **software** (`emulate` feature, or non-x86_64 targets): executes
//!   the descriptor on the CPU and writes the completion record, so the
//!   device layer above runs unchanged on machines without a DSA.
//!
//! # Safety
//!
//! Submission is unsafe: the portal must be a valid mapping, the
//! descriptor addresses must be valid for the transfer size, and the
//! completion record must stay alive until the device writes it.

use crate::descriptor::DsaCompletionRecord;
use crate::descriptor::DsaHwDesc;
use std::time::Duration;

/// Outcome of a completion wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The device wrote the completion record.
    Completed,
    /// The wait budget expired; the record may still be written later.
    TimedOut,
}

// ============================================================================
// Hardware Implementation (x86_64)
// ============================================================================

#[cfg(all(target_arch = "x86_64", not(feature = "emulate")))]
mod hw_impl {
    use super::*;
    use core::arch::x86_64::{__cpuid, __cpuid_count, _rdtsc};
    use std::sync::OnceLock;
    use std::time::Instant;

    /// Submit a descriptor by a fenced 64-byte direct store to the portal.
    ///
    /// # Safety
    ///
    /// - `portal` must be a valid mapped work-queue portal
    /// - `desc` must be a fully initialized 64-byte descriptor whose
    ///   completion record outlives the operation
    ///
    /// # Instruction Details
    ///
    /// `MOVDIR64B r64, m512` (66 0F 38 F8 /r) reads 64 bytes from the
    /// memory operand and performs a 64-byte direct store to the address
    /// in the register operand. The preceding SFENCE orders prior stores
    /// (the descriptor body) before the submission store. Encoding
    /// matches the Linux kernel's `arch/x86/include/asm/special_insns.h`.
    #[inline]
    pub unsafe fn submit_descriptor(portal: *mut u8, desc: &DsaHwDesc) {
        core::arch::asm!(
            "sfence",
            ".byte 0x66, 0x0f, 0x38, 0xf8, 0x02",
            in("rax") portal,
            in("rdx") desc as *const DsaHwDesc,
            options(nostack, preserves_flags)
        );
    }

    /// Arm the address monitor on `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be valid for reads. Requires WAITPKG.
    #[inline]
    unsafe fn umonitor(addr: *const u8) {
        // UMONITOR r64: F3 (REX.W) 0F AE /6, kernel encoding.
        core::arch::asm!(
            ".byte 0xf3, 0x48, 0x0f, 0xae, 0xf0",
            in("rax") addr,
            options(nostack, preserves_flags)
        );
    }

    /// Park until the monitored address is written or the TSC deadline
    /// passes.
    ///
    /// # Safety
    ///
    /// Requires WAITPKG and a previously armed monitor.
    #[inline]
    unsafe fn umwait(deadline: u64) {
        // UMWAIT r32: F2 (REX.W) 0F AE /6, kernel encoding. ECX = 0
        // permits the deeper C0.2 state; EDX:EAX carry the deadline.
        core::arch::asm!(
            ".byte 0xf2, 0x48, 0x0f, 0xae, 0xf1",
            in("ecx") 0u32,
            in("eax") (deadline & 0xffff_ffff) as u32,
            in("edx") (deadline >> 32) as u32,
            options(nostack)
        );
    }

    /// Current timestamp-counter value.
    #[inline]
    pub fn now_cycles() -> u64 {
        unsafe { _rdtsc() }
    }

    /// TSC ticks per millisecond, calibrated once against the wall clock.
    pub fn cycles_per_ms() -> u64 {
        static CYCLES_PER_MS: OnceLock<u64> = OnceLock::new();
        *CYCLES_PER_MS.get_or_init(|| {
            let wall = Instant::now();
            let start = now_cycles();
            std::thread::sleep(Duration::from_millis(10));
            let cycles = now_cycles().wrapping_sub(start);
            let micros = wall.elapsed().as_micros().max(1) as u64;
            (cycles.saturating_mul(1000) / micros).max(1)
        })
    }

    /// Whether the CPU supports UMONITOR/UMWAIT (CPUID.7.0:ECX bit 5).
    fn has_waitpkg() -> bool {
        static WAITPKG: OnceLock<bool> = OnceLock::new();
        *WAITPKG.get_or_init(|| {
            let max_leaf = unsafe { __cpuid(0) }.eax;
            if max_leaf < 7 {
                return false;
            }
            unsafe { __cpuid_count(7, 0) }.ecx & (1 << 5) != 0
        })
    }

    /// Spin until the completion record is written or the budget expires.
    ///
    /// Uses UMONITOR/UMWAIT when the CPU has WAITPKG, otherwise a plain
    /// pause loop against the same TSC deadline.
    pub fn wait_for_completion(record: &DsaCompletionRecord, budget: Duration) -> WaitOutcome {
        let deadline =
            now_cycles().wrapping_add((budget.as_millis() as u64).saturating_mul(cycles_per_ms()));

        if has_waitpkg() {
            loop {
                if record.is_complete() {
                    return WaitOutcome::Completed;
                }
                unsafe { umonitor(record.status_ptr()) };
                // Re-check between arming the monitor and parking.
                if record.is_complete() {
                    return WaitOutcome::Completed;
                }
                if now_cycles() >= deadline {
                    return WaitOutcome::TimedOut;
                }
                unsafe { umwait(deadline) };
            }
        } else {
            loop {
                if record.is_complete() {
                    return WaitOutcome::Completed;
                }
                if now_cycles() >= deadline {
                    return WaitOutcome::TimedOut;
                }
                core::hint::spin_loop();
            }
        }
    }
}

// ============================================================================
// Software Implementation (emulation, and non-x86_64 targets)
// ============================================================================

#[cfg(any(not(target_arch = "x86_64"), feature = "emulate"))]
mod soft_impl {
    use super::*;
    use crate::descriptor::{DSA_COMP_BAD_OPCODE, DSA_COMP_SUCCESS};
    use crate::opcode::DsaOpcode;
    use std::time::Instant;

    /// Execute the descriptor on the CPU and write its completion record.
    ///
    /// The portal is ignored; the submission completes synchronously, so
    /// the wait that follows observes a written record immediately.
    ///
    /// # Safety
    ///
    /// Same contract as the hardware store: descriptor addresses must be
    /// valid for `xfer_size` bytes and the completion record writable.
    pub unsafe fn submit_descriptor(_portal: *mut u8, desc: &DsaHwDesc) {
        let len = desc.xfer_size as usize;
        let status = match desc.opcode() {
            op if op == DsaOpcode::MemMove.as_u8() => {
                std::ptr::copy(desc.src_addr as *const u8, desc.dst_addr as *mut u8, len);
                DSA_COMP_SUCCESS
            }
            op if op == DsaOpcode::MemFill.as_u8() => {
                let pattern = desc.src_addr.to_le_bytes();
                let dst = desc.dst_addr as *mut u8;
                for i in 0..len {
                    *dst.add(i) = pattern[i % 8];
                }
                DSA_COMP_SUCCESS
            }
            op if op == DsaOpcode::Noop.as_u8() => DSA_COMP_SUCCESS,
            _ => DSA_COMP_BAD_OPCODE,
        };

        if desc.completion_addr != 0 {
            let record = desc.completion_addr as *mut DsaCompletionRecord;
            if status == DSA_COMP_SUCCESS {
                (*record).bytes_completed = desc.xfer_size;
            }
            (*record).write_status(status);
        }
    }

    /// Coarse stand-in for the timestamp counter.
    pub fn now_cycles() -> u64 {
        use std::sync::OnceLock;
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }

    /// Spin on a wall-clock deadline.
    pub fn wait_for_completion(record: &DsaCompletionRecord, budget: Duration) -> WaitOutcome {
        let deadline = Instant::now() + budget;
        loop {
            if record.is_complete() {
                return WaitOutcome::Completed;
            }
            if Instant::now() >= deadline {
                return WaitOutcome::TimedOut;
            }
            core::hint::spin_loop();
        }
    }
}

#[cfg(all(target_arch = "x86_64", not(feature = "emulate")))]
pub use hw_impl::{now_cycles, submit_descriptor, wait_for_completion};

#[cfg(any(not(target_arch = "x86_64"), feature = "emulate"))]
pub use soft_impl::{now_cycles, submit_descriptor, wait_for_completion};

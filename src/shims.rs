// DSA Memory Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Drop-in replacements for the bulk memory primitives.
//!
//! The `dsa_memcpy!`/`dsa_memmove!`/`dsa_memset!`/`dsa_memcmp!` macros
//! capture their call site, count calls of at least
//! [`TELEMETRY_MIN_SIZE`] bytes in the global telemetry sink, and
//! delegate to the global [`Container`]. Compare is counted but never
//! offloaded.
//!
//! The telemetry gate (1 KiB) and the offload threshold (128 KiB,
//! [`Config`](crate::Config)) are independent: the former selects call
//! sites worth studying, the latter selects individual calls worth
//! offloading.

use crate::container::Container;
use crate::telemetry::{CallSite, PrimitiveKind, TELEMETRY_MIN_SIZE};

/// `memcpy` replacement. Use through [`dsa_memcpy!`](crate::dsa_memcpy).
///
/// # Safety
///
/// `src` must be valid for `n` reads, `dst` for `n` writes, and the
/// regions must not overlap.
pub unsafe fn memcpy_at(dst: *mut u8, src: *const u8, n: usize, site: CallSite) -> *mut u8 {
    let engine = Container::global();
    if n >= TELEMETRY_MIN_SIZE {
        engine.telemetry().record(PrimitiveKind::Copy, &site, n);
    }
    engine.copy(dst, src, n)
}

/// `memmove` replacement. Use through [`dsa_memmove!`](crate::dsa_memmove).
///
/// # Safety
///
/// `src` must be valid for `n` reads and `dst` for `n` writes; the
/// regions may overlap.
pub unsafe fn memmove_at(dst: *mut u8, src: *const u8, n: usize, site: CallSite) -> *mut u8 {
    let engine = Container::global();
    if n >= TELEMETRY_MIN_SIZE {
        engine.telemetry().record(PrimitiveKind::Move, &site, n);
    }
    engine.copy(dst, src, n)
}

/// `memset` replacement. Use through [`dsa_memset!`](crate::dsa_memset).
///
/// # Safety
///
/// `dst` must be valid for `n` writes.
pub unsafe fn memset_at(dst: *mut u8, value: u8, n: usize, site: CallSite) -> *mut u8 {
    let engine = Container::global();
    if n >= TELEMETRY_MIN_SIZE {
        engine.telemetry().record(PrimitiveKind::Set, &site, n);
    }
    engine.fill(dst, n, value)
}

/// `memcmp` replacement. Use through [`dsa_memcmp!`](crate::dsa_memcmp).
///
/// Counted in telemetry, never offloaded.
///
/// # Safety
///
/// Both pointers must be valid for `n` reads.
pub unsafe fn memcmp_at(lhs: *const u8, rhs: *const u8, n: usize, site: CallSite) -> i32 {
    if n >= TELEMETRY_MIN_SIZE {
        Container::global()
            .telemetry()
            .record(PrimitiveKind::Compare, &site, n);
    }

    let a = std::slice::from_raw_parts(lhs, n);
    let b = std::slice::from_raw_parts(rhs, n);
    match a.cmp(b) {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

/// Copy `n` bytes from `src` to `dst` (non-overlapping), recording the
/// call site.
#[macro_export]
macro_rules! dsa_memcpy {
    ($dst:expr, $src:expr, $n:expr) => {
        $crate::shims::memcpy_at($dst, $src, $n, $crate::callsite!())
    };
}

/// Copy `n` bytes from `src` to `dst` (overlap allowed), recording the
/// call site.
#[macro_export]
macro_rules! dsa_memmove {
    ($dst:expr, $src:expr, $n:expr) => {
        $crate::shims::memmove_at($dst, $src, $n, $crate::callsite!())
    };
}

/// Write `n` bytes of `value` at `dst`, recording the call site.
#[macro_export]
macro_rules! dsa_memset {
    ($dst:expr, $value:expr, $n:expr) => {
        $crate::shims::memset_at($dst, $value, $n, $crate::callsite!())
    };
}

/// Compare `n` bytes, recording the call site. Returns negative, zero,
/// or positive like `memcmp`.
#[macro_export]
macro_rules! dsa_memcmp {
    ($lhs:expr, $rhs:expr, $n:expr) => {
        $crate::shims::memcmp_at($lhs, $rhs, $n, $crate::callsite!())
    };
}

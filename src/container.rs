// DSA Memory Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! The process-wide device container.
//!
//! The container enumerates accelerators once, indexes them by NUMA
//! node, and dispatches copy/fill requests to the device closest to the
//! destination buffer. Every failure path degrades to the CPU
//! primitive, so callers observe identical semantics whether or not an
//! accelerator did the work.
//!
//! Callers that emit many small adjacent writes destined for one
//! logical buffer can stage them ([`Container::stage_copy`]) and flush
//! them as a single submission ([`Container::flush_staged`]); one
//! descriptor per small write would be dominated by submission and
//! completion overhead.

use crate::accfg::AccfgCtx;
use crate::device::Device;
use crate::error::DsaError;
use crate::numa;
use crate::telemetry::Telemetry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

/// Maximum number of devices the container manages.
const MAX_DEVICES: usize = 16;

/// Size of the NUMA-node → device index.
const MAX_NUMA_NODES: usize = 16;

/// Outcome of container operations.
///
/// `initialize_status` (the stored first-initialization outcome) gates
/// offload; `current_status` reports the most recent dispatch and is
/// advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    /// Topology query disagreed with the configured node count.
    InvalidNumaNodes = 1,
    /// The accelerator-configuration context could not be opened.
    InvalidAccfgCtx = 2,
    /// A device copy failed and the CPU fallback ran.
    MemcpyFailed = 3,
    /// A device fill failed and the CPU fallback ran.
    MemfillFailed = 4,
    /// `initialize` was called more than once.
    AlreadyInitialized = 5,
    /// `initialize` has not run yet.
    Uninitialized = 6,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::InvalidNumaNodes,
            2 => Self::InvalidAccfgCtx,
            3 => Self::MemcpyFailed,
            4 => Self::MemfillFailed,
            5 => Self::AlreadyInitialized,
            _ => Self::Uninitialized,
        }
    }
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Transfers below this size always take the CPU primitive.
    pub offload_threshold: usize,
    /// Only accelerators whose name starts with this prefix are used.
    pub device_prefix: String,
    /// Wall-clock budget for one completion wait.
    pub wait_budget: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            offload_threshold: 131072,
            device_prefix: "dsa".to_string(),
            wait_budget: Duration::from_millis(300),
        }
    }
}

/// One staged small write awaiting a flush.
#[derive(Debug, Clone, Copy)]
struct StagedCopy {
    src: usize,
    len: usize,
    /// Groups entries that converge on one logical buffer.
    origin: usize,
}

/// Devices and their NUMA index, built once by `initialize`.
struct EngineState {
    devices: Vec<Device>,
    by_node: [Option<usize>; MAX_NUMA_NODES],
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            by_node: [None; MAX_NUMA_NODES],
        }
    }
}

impl Drop for EngineState {
    fn drop(&mut self) {
        // Release devices in reverse order of creation.
        while self.devices.pop().is_some() {}
    }
}

/// The offload engine. One per process in normal use; see
/// [`Container::global`].
pub struct Container {
    config: Config,
    initialized: Mutex<bool>,
    init_status: AtomicU8,
    current_status: AtomicU8,
    state: OnceLock<EngineState>,
    /// Round-robin cursor for destinations whose node has no device.
    rotation: AtomicUsize,
    staged: Mutex<HashMap<usize, StagedCopy>>,
    telemetry: Telemetry,
}

impl Container {
    /// Create an engine with the given tunables. `initialize` must be
    /// called before any offload happens.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            initialized: Mutex::new(false),
            init_status: AtomicU8::new(Status::Uninitialized as u8),
            current_status: AtomicU8::new(Status::Uninitialized as u8),
            state: OnceLock::new(),
            rotation: AtomicUsize::new(0),
            staged: Mutex::new(HashMap::new()),
            telemetry: Telemetry::new(),
        }
    }

    /// The process-wide container, constructed on first call with the
    /// default configuration.
    pub fn global() -> &'static Container {
        static GLOBAL: OnceLock<Container> = OnceLock::new();
        GLOBAL.get_or_init(|| Container::new(Config::default()))
    }

    /// One-shot engine initialization.
    ///
    /// Validates the NUMA topology, opens the accelerator context,
    /// probes every matching device, and indexes the survivors by node.
    /// The first call's result is stored and gates all offload; any
    /// later call returns [`Status::AlreadyInitialized`] without
    /// touching state.
    pub fn initialize(&self) -> Status {
        let mut initialized = self.initialized.lock().unwrap();
        if *initialized {
            return Status::AlreadyInitialized;
        }
        *initialized = true;

        let status = self.initialize_once();
        self.init_status.store(status as u8, Ordering::Release);
        status
    }

    fn initialize_once(&self) -> Status {
        let populated = numa::populated_nodes().unwrap_or(0);
        let configured = numa::configured_nodes().unwrap_or(0);
        if populated != configured {
            log::warn!("numa topology mismatch: {populated} populated, {configured} configured");
            return Status::InvalidNumaNodes;
        }

        let listed = match AccfgCtx::new().and_then(|ctx| ctx.devices()) {
            Ok(listed) => listed,
            Err(err) => {
                log::info!("no accelerator context, staying on cpu: {err}");
                return Status::InvalidAccfgCtx;
            }
        };

        let mut state = EngineState::default();
        for accfg_dev in &listed {
            if !accfg_dev.name.starts_with(&self.config.device_prefix) {
                continue;
            }
            if state.devices.len() == MAX_DEVICES {
                break;
            }
            match Device::probe(accfg_dev, self.config.wait_budget) {
                Ok(device) => {
                    let node = device.numa_node();
                    let idx = state.devices.len();
                    log::info!(
                        "using {} on node {} with {} work queue(s)",
                        device.name(),
                        node,
                        device.wq_count()
                    );
                    state.devices.push(device);
                    if node < MAX_NUMA_NODES {
                        state.by_node[node] = Some(idx);
                    }
                }
                Err(err) => log::warn!("discarding {}: {err}", accfg_dev.name),
            }
        }

        log::info!("initialized with {} device(s)", state.devices.len());
        let _ = self.state.set(state);
        Status::Ok
    }

    /// Stored outcome of the first `initialize` call.
    pub fn initialize_status(&self) -> Status {
        Status::from_u8(self.init_status.load(Ordering::Acquire))
    }

    /// Outcome of the most recent dispatched operation. Advisory.
    pub fn current_status(&self) -> Status {
        Status::from_u8(self.current_status.load(Ordering::Relaxed))
    }

    fn set_current(&self, status: Status) {
        self.current_status.store(status as u8, Ordering::Relaxed);
    }

    /// Number of usable devices.
    pub fn device_count(&self) -> usize {
        self.state.get().map_or(0, |s| s.devices.len())
    }

    /// Call-site telemetry sink.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Copy `len` bytes from `src` to `dst`, offloading when the engine
    /// is healthy and the transfer is large enough. The regions may
    /// overlap. Always leaves `dst` equal to the original `src` bytes.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `len` reads and `dst` for `len` writes.
    pub unsafe fn copy(&self, dst: *mut u8, src: *const u8, len: usize) -> *mut u8 {
        if self.initialize_status() != Status::Ok || len < self.config.offload_threshold {
            std::ptr::copy(src, dst, len);
            return dst;
        }

        let offloaded = match self.select_device(dst) {
            Some(device) => device.copy(dst, src, len),
            None => Err(DsaError::NoDeviceFound),
        };
        match offloaded {
            Ok(()) => self.set_current(Status::Ok),
            Err(err) => {
                log::debug!("memcpy offload failed, cpu fallback: {err}");
                self.set_current(Status::MemcpyFailed);
                std::ptr::copy(src, dst, len);
            }
        }
        dst
    }

    /// Fill `len` bytes at `dst` with `value`, offloading like `copy`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` writes.
    pub unsafe fn fill(&self, dst: *mut u8, len: usize, value: u8) -> *mut u8 {
        if self.initialize_status() != Status::Ok || len < self.config.offload_threshold {
            std::ptr::write_bytes(dst, value, len);
            return dst;
        }

        let offloaded = match self.select_device(dst) {
            Some(device) => device.fill(dst, len, value),
            None => Err(DsaError::NoDeviceFound),
        };
        match offloaded {
            Ok(()) => self.set_current(Status::Ok),
            Err(err) => {
                log::debug!("memfill offload failed, cpu fallback: {err}");
                self.set_current(Status::MemfillFailed);
                std::ptr::write_bytes(dst, value, len);
            }
        }
        dst
    }

    /// Pick the device for a destination: the one indexed at the
    /// destination page's node when present, otherwise advance the
    /// rotation counter modulo the device count, read the node table at
    /// that slot, and take device 0 when the slot is empty.
    fn select_device(&self, dst: *const u8) -> Option<&Device> {
        let state = self.state.get()?;
        if state.devices.is_empty() {
            return None;
        }

        if let Some(node) = numa::page_node(dst) {
            if let Some(&Some(idx)) = state.by_node.get(node) {
                return state.devices.get(idx);
            }
        }

        // devices.len() <= MAX_DEVICES == MAX_NUMA_NODES, so the turn
        // always lands inside the node table.
        let turn = self.rotation.fetch_add(1, Ordering::Relaxed) % state.devices.len();
        match state.by_node[turn] {
            Some(idx) => state.devices.get(idx),
            None => state.devices.first(),
        }
    }

    /// Stage one small write for a later coalesced flush.
    ///
    /// A write that lands exactly at the end of an already-staged
    /// extent with a contiguous source and the same `origin` tag
    /// extends that extent; anything else starts a new entry keyed by
    /// its destination.
    ///
    /// The staging map is intended for a single thread between flushes.
    pub fn stage_copy(&self, dst: *mut u8, src: *const u8, len: usize, origin: *mut u8) {
        if len == 0 {
            return;
        }
        let (dst, src, origin) = (dst as usize, src as usize, origin as usize);

        let mut staged = self.staged.lock().unwrap();
        for (&base, entry) in staged.iter_mut() {
            if base + entry.len == dst && entry.src + entry.len == src && entry.origin == origin {
                entry.len += len;
                return;
            }
        }
        staged.insert(dst, StagedCopy { src, len, origin });
    }

    /// Flush every staged extent carrying `origin` as one copy each,
    /// then drop the entries.
    ///
    /// # Safety
    ///
    /// The source and destination regions staged under `origin` must
    /// still be valid.
    pub unsafe fn flush_staged(&self, origin: *mut u8) {
        let origin = origin as usize;
        let pending: Vec<(usize, StagedCopy)> = self
            .staged
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.origin == origin)
            .map(|(&dst, &entry)| (dst, entry))
            .collect();

        for (dst, entry) in &pending {
            self.copy(*dst as *mut u8, entry.src as *const u8, entry.len);
        }

        // Remove flushed entries only after the traversal.
        let mut staged = self.staged.lock().unwrap();
        for (dst, _) in pending {
            staged.remove(&dst);
        }
    }

    /// Engine with a prebuilt device set, initialized as healthy.
    #[cfg(any(test, feature = "emulate"))]
    pub fn with_devices(config: Config, devices: Vec<Device>) -> Self {
        let container = Self::new(config);
        let mut state = EngineState::default();
        for device in devices {
            let node = device.numa_node();
            let idx = state.devices.len();
            if node < MAX_NUMA_NODES {
                state.by_node[node] = Some(idx);
            }
            state.devices.push(device);
        }
        let _ = container.state.set(state);
        *container.initialized.lock().unwrap() = true;
        container
            .init_status
            .store(Status::Ok as u8, Ordering::Release);
        container
    }

    /// Device by creation index, for inspection.
    #[cfg(any(test, feature = "emulate"))]
    pub fn device_at(&self, idx: usize) -> Option<&Device> {
        self.state.get().and_then(|s| s.devices.get(idx))
    }

    #[cfg(test)]
    fn staged_entries(&self, origin: *mut u8) -> Vec<(usize, usize)> {
        let origin = origin as usize;
        let mut entries: Vec<(usize, usize)> = self
            .staged
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.origin == origin)
            .map(|(&dst, e)| (dst, e.len))
            .collect();
        entries.sort();
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uninitialized() -> Container {
        Container::new(Config::default())
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            Status::Ok,
            Status::InvalidNumaNodes,
            Status::InvalidAccfgCtx,
            Status::MemcpyFailed,
            Status::MemfillFailed,
            Status::AlreadyInitialized,
            Status::Uninitialized,
        ] {
            assert_eq!(Status::from_u8(status as u8), status);
        }
    }

    #[test]
    fn test_cpu_fallback_copy_matches_source() {
        let container = uninitialized();
        assert_eq!(container.initialize_status(), Status::Uninitialized);

        for len in [0usize, 1023, 131071, 1 << 20] {
            let src: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
            let mut dst = vec![0u8; len];
            let ret = unsafe { container.copy(dst.as_mut_ptr(), src.as_ptr(), len) };
            assert_eq!(ret, dst.as_mut_ptr());
            assert_eq!(dst, src);
        }
    }

    #[test]
    fn test_cpu_fallback_fill() {
        let container = uninitialized();
        let mut buf = vec![0xEEu8; 200_000];
        unsafe { container.fill(buf.as_mut_ptr(), 200_000, 0) };
        assert!(buf.iter().all(|&b| b == 0));
        unsafe { container.fill(buf.as_mut_ptr(), 100, 0x7A) };
        assert!(buf[..100].iter().all(|&b| b == 0x7A));
        assert!(buf[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_overlapping_copy_is_move_safe() {
        let container = uninitialized();
        let mut buf: Vec<u8> = (0u8..128).collect();
        let expected: Vec<u8> = buf[..96].to_vec();
        unsafe {
            let base = buf.as_mut_ptr();
            container.copy(base.add(32), base, 96);
        }
        assert_eq!(&buf[32..], &expected[..]);
    }

    #[test]
    fn test_double_initialize_is_idempotent() {
        let container = uninitialized();
        let first = container.initialize();
        assert_ne!(first, Status::AlreadyInitialized);
        assert_eq!(container.initialize_status(), first);

        let devices_after_first = container.device_count();
        assert_eq!(container.initialize(), Status::AlreadyInitialized);
        assert_eq!(container.initialize_status(), first);
        assert_eq!(container.device_count(), devices_after_first);
    }

    #[test]
    fn test_stage_extends_adjacent_same_origin() {
        let container = uninitialized();
        let src = vec![0u8; 3 * 4096];
        let mut dst = vec![0u8; 3 * 4096];
        let origin = dst.as_mut_ptr();

        unsafe {
            let (d, s) = (dst.as_mut_ptr(), src.as_ptr());
            container.stage_copy(d, s, 4096, origin);
            container.stage_copy(d.add(4096), s.add(4096), 4096, origin);
            container.stage_copy(d.add(8192), s.add(8192), 4096, origin);
        }

        let entries = container.staged_entries(origin);
        assert_eq!(entries, vec![(dst.as_ptr() as usize, 3 * 4096)]);
    }

    #[test]
    fn test_stage_splits_on_gap_or_foreign_origin() {
        let container = uninitialized();
        let src = vec![0u8; 4 * 4096];
        let mut dst = vec![0u8; 4 * 4096];
        let origin = dst.as_mut_ptr();
        let other_origin = src.as_ptr() as *mut u8;

        unsafe {
            let (d, s) = (dst.as_mut_ptr(), src.as_ptr());
            container.stage_copy(d, s, 4096, origin);
            // Gap in the destination: new entry.
            container.stage_copy(d.add(8192), s.add(8192), 4096, origin);
            // Adjacent but different tag: new entry.
            container.stage_copy(d.add(4096), s.add(4096), 4096, other_origin);
        }

        assert_eq!(container.staged_entries(origin).len(), 2);
        assert_eq!(container.staged_entries(other_origin).len(), 1);
    }

    #[test]
    fn test_flush_copies_and_clears_matching_tag_only() {
        let container = uninitialized();
        let src: Vec<u8> = (0..3 * 4096).map(|i| (i % 241) as u8).collect();
        let mut dst = vec![0u8; 3 * 4096];
        let mut unrelated_dst = vec![0u8; 4096];
        let unrelated_src = vec![9u8; 4096];
        let origin = dst.as_mut_ptr();
        let other_origin = unrelated_dst.as_mut_ptr();

        unsafe {
            let (d, s) = (dst.as_mut_ptr(), src.as_ptr());
            container.stage_copy(d, s, 4096, origin);
            container.stage_copy(d.add(4096), s.add(4096), 4096, origin);
            container.stage_copy(d.add(8192), s.add(8192), 4096, origin);
            container.stage_copy(unrelated_dst.as_mut_ptr(), unrelated_src.as_ptr(), 4096, other_origin);

            container.flush_staged(origin);
        }

        assert_eq!(dst, src);
        assert!(container.staged_entries(origin).is_empty());
        // The other tag stays staged and its destination untouched.
        assert_eq!(container.staged_entries(other_origin).len(), 1);
        assert!(unrelated_dst.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_teardown_releases_devices_in_reverse_order() {
        use crate::device::DropProbe;
        use std::sync::{Arc, Mutex};

        let probe: DropProbe = Arc::new(Mutex::new(Vec::new()));
        let mut devices = Vec::new();
        for name in ["dsa0", "dsa1", "dsa2"] {
            let mut device = Device::emulated(name, 0, 2);
            device.set_drop_probe(probe.clone());
            devices.push(device);
        }

        let container = Container::with_devices(Config::default(), devices);
        assert_eq!(container.device_count(), 3);
        assert!(probe.lock().unwrap().is_empty());

        drop(container);

        // Devices go down in reverse order of creation, each releasing
        // its work-queue slots; every created device and slot reports
        // in, so nothing leaks past the container.
        let expected: Vec<String> = [
            "dsa2", "dsa2/wq0", "dsa2/wq1", //
            "dsa1", "dsa1/wq0", "dsa1/wq1", //
            "dsa0", "dsa0/wq0", "dsa0/wq1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(*probe.lock().unwrap(), expected);
    }

    // Dispatch through emulated devices; run with `--features emulate`.
    #[cfg(feature = "emulate")]
    mod emulated {
        use super::*;

        #[test]
        fn test_large_copy_goes_through_device() {
            let container =
                Container::with_devices(Config::default(), vec![Device::emulated("dsa0", 0, 4)]);
            let len = 1 << 20;
            let src: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut dst = vec![0u8; len];

            unsafe { container.copy(dst.as_mut_ptr(), src.as_ptr(), len) };

            assert_eq!(dst, src);
            assert_eq!(container.current_status(), Status::Ok);
            let total: u64 = (0..container.device_count())
                .map(|i| container.device_at(i).unwrap().submissions())
                .sum();
            assert_eq!(total, 1);
        }

        #[test]
        fn test_threshold_gate_keeps_small_copies_on_cpu() {
            let container =
                Container::with_devices(Config::default(), vec![Device::emulated("dsa0", 0, 1)]);
            let src = vec![3u8; 131071];
            let mut dst = vec![0u8; 131071];

            unsafe { container.copy(dst.as_mut_ptr(), src.as_ptr(), 131071) };

            assert_eq!(dst, src);
            assert_eq!(container.device_at(0).unwrap().submissions(), 0);
        }

        #[test]
        fn test_fill_goes_through_device() {
            let container =
                Container::with_devices(Config::default(), vec![Device::emulated("dsa0", 0, 1)]);
            let mut buf = vec![0xFFu8; 1 << 18];

            unsafe { container.fill(buf.as_mut_ptr(), buf.len(), 0) };

            assert!(buf.iter().all(|&b| b == 0));
            assert_eq!(container.current_status(), Status::Ok);
            assert_eq!(container.device_at(0).unwrap().submissions(), 1);
        }

        #[test]
        fn test_healthy_engine_without_devices_falls_back() {
            let container = Container::with_devices(Config::default(), Vec::new());
            let len = 1 << 20;
            let src = vec![5u8; len];
            let mut dst = vec![0u8; len];

            unsafe { container.copy(dst.as_mut_ptr(), src.as_ptr(), len) };

            assert_eq!(dst, src);
            assert_eq!(container.current_status(), Status::MemcpyFailed);

            unsafe { container.fill(dst.as_mut_ptr(), len, 0) };
            assert!(dst.iter().all(|&b| b == 0));
            assert_eq!(container.current_status(), Status::MemfillFailed);
        }

        #[test]
        fn test_routing_uses_some_device_when_node_has_none() {
            // Devices on high nodes this host does not populate: the
            // precise lookup misses and the rotation fallback must
            // still land on a real device.
            let container = Container::with_devices(
                Config::default(),
                vec![
                    Device::emulated("dsa0", 14, 1),
                    Device::emulated("dsa1", 15, 1),
                ],
            );
            let len = 1 << 19;
            let src = vec![8u8; len];
            let mut dst = vec![0u8; len];

            unsafe { container.copy(dst.as_mut_ptr(), src.as_ptr(), len) };

            assert_eq!(dst, src);
            assert_eq!(container.current_status(), Status::Ok);
            let total: u64 = (0..2)
                .map(|i| container.device_at(i).unwrap().submissions())
                .sum();
            assert_eq!(total, 1);
        }

        #[test]
        fn test_coalesced_flush_is_one_submission() {
            let mut config = Config::default();
            config.offload_threshold = 8192;
            let container =
                Container::with_devices(config, vec![Device::emulated("dsa0", 0, 1)]);
            let src: Vec<u8> = (0..3 * 4096).map(|i| (i % 239) as u8).collect();
            let mut dst = vec![0u8; 3 * 4096];
            let origin = dst.as_mut_ptr();

            unsafe {
                let (d, s) = (dst.as_mut_ptr(), src.as_ptr());
                container.stage_copy(d, s, 4096, origin);
                container.stage_copy(d.add(4096), s.add(4096), 4096, origin);
                container.stage_copy(d.add(8192), s.add(8192), 4096, origin);
                container.flush_staged(origin);
            }

            assert_eq!(dst, src);
            // Three staged writes, one descriptor.
            assert_eq!(container.device_at(0).unwrap().submissions(), 1);
        }
    }
}

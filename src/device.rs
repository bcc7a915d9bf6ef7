// DSA Memory Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! A single accelerator and its work-queue portals.
//!
//! A [`Device`] owns up to 16 work-queue slots, each a device file plus
//! one write-mapped portal page. One operation is one descriptor: built,
//! stored to the portal picked round-robin by the task counter, then
//! waited on until the device writes the completion record.
//!
//! The device does not transparently handle faulting pages: it stops at
//! the first missing page and reports how many bytes it processed.
//! Touching the faulting byte forces the OS to materialize the page,
//! after which the operation resumes at the offset the device reached.

use crate::accfg::AccfgDevice;
use crate::descriptor::{DescriptorFlags, DsaCompletionRecord, DsaHwDesc};
use crate::error::{DsaError, DsaResult};
use crate::opcode::DsaOpcode;
use crate::submit::{self, WaitOutcome};
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;
#[cfg(target_os = "linux")]
use std::path::Path;

#[cfg(test)]
use std::sync::{Arc, Mutex};

/// Shared log of teardown events, labeled per device and slot.
#[cfg(test)]
pub(crate) type DropProbe = Arc<Mutex<Vec<String>>>;

/// Portal size for mmap (one page).
const PORTAL_SIZE: usize = 4096;

/// Maximum work-queue slots per device.
const MAX_WQS_PER_DEVICE: usize = 16;

#[cfg(any(test, feature = "emulate"))]
const EMULATED_WAIT_BUDGET: Duration = Duration::from_millis(100);

/// A mapped submission portal.
enum Portal {
    /// Page mapped write-only from the work-queue device file.
    #[cfg(target_os = "linux")]
    Mapped { ptr: *mut u8 },
    /// Heap-backed page for the software executor.
    #[cfg(any(test, feature = "emulate", not(target_os = "linux")))]
    Owned(Box<[u8; PORTAL_SIZE]>),
}

impl Portal {
    fn as_ptr(&self) -> *mut u8 {
        match self {
            #[cfg(target_os = "linux")]
            Portal::Mapped { ptr } => *ptr,
            #[cfg(any(test, feature = "emulate", not(target_os = "linux")))]
            Portal::Owned(page) => page.as_ptr() as *mut u8,
        }
    }
}

impl Drop for Portal {
    fn drop(&mut self) {
        match self {
            #[cfg(target_os = "linux")]
            Portal::Mapped { ptr } => unsafe {
                libc::munmap(*ptr as *mut libc::c_void, PORTAL_SIZE);
            },
            #[cfg(any(test, feature = "emulate", not(target_os = "linux")))]
            Portal::Owned(_) => {}
        }
    }
}

/// One work-queue slot: the open device file and its portal.
struct WqSlot {
    /// Kept open for the lifetime of the mapping. `None` only for
    /// emulated slots.
    #[allow(dead_code)]
    file: Option<File>,
    portal: Portal,
    /// Labels this slot's release in teardown tests.
    #[cfg(test)]
    drop_probe: Option<(String, DropProbe)>,
}

#[cfg(test)]
impl Drop for WqSlot {
    fn drop(&mut self) {
        if let Some((label, probe)) = &self.drop_probe {
            probe.lock().unwrap().push(label.clone());
        }
    }
}

impl WqSlot {
    #[cfg(target_os = "linux")]
    fn open(path: &Path) -> DsaResult<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    DsaError::PermissionDenied(path.display().to_string())
                } else {
                    DsaError::Io(e)
                }
            })?;

        let portal = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                PORTAL_SIZE,
                libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                file.as_raw_fd(),
                0,
            )
        };
        if portal == libc::MAP_FAILED {
            return Err(DsaError::MmapFailed(path.display().to_string()));
        }

        Ok(Self {
            file: Some(file),
            portal: Portal::Mapped {
                ptr: portal as *mut u8,
            },
            #[cfg(test)]
            drop_probe: None,
        })
    }
}

/// One physical accelerator.
pub struct Device {
    name: String,
    numa_node: usize,
    wait_budget: Duration,
    slots: Vec<WqSlot>,
    /// Spreads submissions round-robin across the slots.
    task_counter: AtomicU64,
    #[cfg(test)]
    drop_probe: Option<DropProbe>,
}

#[cfg(test)]
impl Drop for Device {
    fn drop(&mut self) {
        if let Some(probe) = &self.drop_probe {
            probe.lock().unwrap().push(self.name.clone());
        }
    }
}

// SAFETY: the portal mappings stay valid for the lifetime of their
// slots, each submission is a single independent 64-byte store, and the
// task counter is atomic. Per-submission completion records are owned
// by the submitting call.
unsafe impl Send for Device {}
unsafe impl Sync for Device {}

impl Device {
    /// Open every advertised user work queue of `dev` and map its
    /// portal.
    ///
    /// Any queue that fails to open or map aborts the probe; the
    /// container discards such devices. A device without a single
    /// usable queue is equally unusable.
    #[cfg(target_os = "linux")]
    pub fn probe(dev: &AccfgDevice, wait_budget: Duration) -> DsaResult<Self> {
        if dev.compl_align > std::mem::align_of::<DsaCompletionRecord>() {
            return Err(DsaError::UnsupportedComplAlign(dev.compl_align));
        }

        let mut slots = Vec::new();
        for path in dev.wq_paths.iter().take(MAX_WQS_PER_DEVICE) {
            slots.push(WqSlot::open(path)?);
        }
        if slots.is_empty() {
            return Err(DsaError::NoWorkQueue);
        }

        Ok(Self {
            name: dev.name.clone(),
            numa_node: dev.numa_node,
            wait_budget,
            slots,
            task_counter: AtomicU64::new(0),
            #[cfg(test)]
            drop_probe: None,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn probe(_dev: &AccfgDevice, _wait_budget: Duration) -> DsaResult<Self> {
        Err(DsaError::PlatformNotSupported)
    }

    /// Device backed by the software executor instead of hardware.
    #[cfg(any(test, feature = "emulate"))]
    pub fn emulated(name: &str, numa_node: usize, wq_count: usize) -> Self {
        let slots = (0..wq_count.clamp(1, MAX_WQS_PER_DEVICE))
            .map(|_| WqSlot {
                file: None,
                portal: Portal::Owned(Box::new([0u8; PORTAL_SIZE])),
                #[cfg(test)]
                drop_probe: None,
            })
            .collect();
        Self {
            name: name.to_string(),
            numa_node,
            wait_budget: EMULATED_WAIT_BUDGET,
            slots,
            task_counter: AtomicU64::new(0),
            #[cfg(test)]
            drop_probe: None,
        }
    }

    /// Register a teardown log on this device and each of its slots.
    #[cfg(test)]
    pub(crate) fn set_drop_probe(&mut self, probe: DropProbe) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.drop_probe = Some((format!("{}/wq{i}", self.name), probe.clone()));
        }
        self.drop_probe = Some(probe);
    }

    /// Device name, e.g. "dsa0".
    pub fn name(&self) -> &str {
        &self.name
    }

    /// NUMA node the device services.
    pub fn numa_node(&self) -> usize {
        self.numa_node
    }

    /// Number of usable work queues.
    pub fn wq_count(&self) -> usize {
        self.slots.len()
    }

    /// Descriptors submitted so far.
    pub fn submissions(&self) -> u64 {
        self.task_counter.load(Ordering::Relaxed)
    }

    /// Offload one MEMMOVE of `len` bytes from `src` to `dst`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for `len` reads, `dst` for `len` writes. The
    /// regions may overlap.
    pub unsafe fn copy(&self, dst: *mut u8, src: *const u8, len: usize) -> DsaResult<()> {
        self.execute(DsaOpcode::MemMove, src as u64, dst as u64, len)
    }

    /// Offload one MEMFILL writing `len` bytes of `value` to `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for `len` writes.
    pub unsafe fn fill(&self, dst: *mut u8, len: usize, value: u8) -> DsaResult<()> {
        let pattern = u64::from_le_bytes([value; 8]);
        self.execute(DsaOpcode::MemFill, pattern, dst as u64, len)
    }

    /// Submission protocol shared by copy and fill. `src` carries the
    /// source address for MEMMOVE and the fill pattern for MEMFILL.
    unsafe fn execute(
        &self,
        opcode: DsaOpcode,
        mut src: u64,
        mut dst: u64,
        mut len: usize,
    ) -> DsaResult<()> {
        if len == 0 {
            return Ok(());
        }
        if len > u32::MAX as usize {
            return Err(DsaError::TransferTooLarge(len));
        }

        loop {
            let record = Box::new(DsaCompletionRecord::new());
            let mut desc = DsaHwDesc::new();
            desc.set_flags(DescriptorFlags::SUBMIT);
            desc.set_opcode(opcode);
            desc.src_addr = src;
            desc.dst_addr = dst;
            desc.xfer_size = len as u32;
            desc.completion_addr = record.as_ref() as *const DsaCompletionRecord as u64;
            desc.set_priv(true);

            let turn = self.task_counter.fetch_add(1, Ordering::Relaxed) as usize;
            let slot = &self.slots[turn % self.slots.len()];
            submit::submit_descriptor(slot.portal.as_ptr(), &desc);

            if submit::wait_for_completion(&record, self.wait_budget) == WaitOutcome::TimedOut {
                // The device can still write the record after we give
                // up; it must outlive this call.
                log::warn!("{}: completion wait timed out, abandoning record", self.name);
                Box::leak(record);
                return Err(DsaError::WaitTimeout);
            }

            let status = record.status();
            if status.is_success() {
                return Ok(());
            }
            if !status.is_page_fault() {
                return Err(DsaError::OperationFailed {
                    status: record.raw_status(),
                    result: record.result,
                });
            }

            // Partial completion: the device stopped at the first
            // missing page and reported its progress.
            let done = record.bytes_completed as usize;
            dst += done as u64;
            len -= done;
            touch_fault_addr(record.fault_addr);

            if opcode == DsaOpcode::MemFill {
                // Finish the remainder on the CPU; src holds the
                // pattern, whose low byte is the fill value.
                std::ptr::write_bytes(dst as *mut u8, (src & 0xff) as u8, len);
                return Ok(());
            }
            src += done as u64;
        }
    }
}

/// Force the faulting page resident without changing its contents.
unsafe fn touch_fault_addr(addr: u64) {
    if addr == 0 {
        return;
    }
    let p = addr as *mut u8;
    let v = std::ptr::read_volatile(p);
    std::ptr::write_volatile(p, !v);
    std::ptr::write_volatile(p, v);
}

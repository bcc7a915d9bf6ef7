// DSA Memory Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Accelerator-configuration context.
//!
//! The kernel's IDXD driver exposes DSA devices in
//! `/sys/bus/dsa/devices/` as `dsa0`, `dsa1`, ... with their work queues
//! as `wq0.0`, `wq0.1`, ... Work queues of type `user` have character
//! devices under `/dev/dsa/` whose mapped page is the submission portal.
//!
//! This module reads that surface: which devices exist, which NUMA node
//! each lives on, the completion-record alignment it requires, and the
//! device files of its usable work queues.

use crate::error::{DsaError, DsaResult};
use std::fs;
use std::path::{Path, PathBuf};

/// Sysfs base path for DSA devices.
#[cfg(target_os = "linux")]
const SYSFS_DSA_PATH: &str = "/sys/bus/dsa/devices";

/// Device node base path for DSA work queues.
#[cfg(target_os = "linux")]
const DEV_DSA_PATH: &str = "/dev/dsa";

/// Completion-record alignment assumed when the device does not say.
const DEFAULT_COMPL_ALIGN: usize = 32;

/// One enumerated accelerator.
#[derive(Debug, Clone)]
pub struct AccfgDevice {
    /// Device name (e.g. "dsa0").
    pub name: String,
    /// NUMA node the device is attached to.
    pub numa_node: usize,
    /// Required completion-record alignment in bytes.
    pub compl_align: usize,
    /// Device files of the enabled user work queues, in name order.
    pub wq_paths: Vec<PathBuf>,
}

/// Handle on the accel-config sysfs surface.
#[derive(Debug)]
pub struct AccfgCtx {
    sysfs: PathBuf,
    dev: PathBuf,
}

impl AccfgCtx {
    /// Open the platform accelerator context.
    ///
    /// Fails when the IDXD sysfs surface is absent (no driver, or not
    /// Linux).
    #[cfg(target_os = "linux")]
    pub fn new() -> DsaResult<Self> {
        Self::with_paths(PathBuf::from(SYSFS_DSA_PATH), PathBuf::from(DEV_DSA_PATH))
    }

    #[cfg(not(target_os = "linux"))]
    pub fn new() -> DsaResult<Self> {
        Err(DsaError::PlatformNotSupported)
    }

    /// Open against explicit sysfs/dev roots.
    pub(crate) fn with_paths(sysfs: PathBuf, dev: PathBuf) -> DsaResult<Self> {
        if !sysfs.is_dir() {
            return Err(DsaError::PlatformNotSupported);
        }
        Ok(Self { sysfs, dev })
    }

    /// Enumerate all accelerators, regardless of device family.
    ///
    /// Name filtering is the caller's policy; see
    /// [`Config::device_prefix`](crate::Config).
    pub fn devices(&self) -> DsaResult<Vec<AccfgDevice>> {
        let mut names: Vec<String> = Vec::new();
        for entry in fs::read_dir(&self.sysfs)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            // Work queues and engines carry a '.'; devices do not.
            if !name.contains('.') {
                names.push(name);
            }
        }
        names.sort();

        let mut devices = Vec::with_capacity(names.len());
        for name in names {
            devices.push(self.read_device(&name)?);
        }
        Ok(devices)
    }

    fn read_device(&self, name: &str) -> DsaResult<AccfgDevice> {
        let dev_dir = self.sysfs.join(name);

        let numa_node = read_sysfs_i64(&dev_dir.join("numa_node"))
            .unwrap_or(0)
            .max(0) as usize;
        let compl_align =
            read_sysfs_i64(&dev_dir.join("compl_size")).unwrap_or(DEFAULT_COMPL_ALIGN as i64)
                as usize;

        Ok(AccfgDevice {
            name: name.to_string(),
            numa_node,
            compl_align,
            wq_paths: self.user_wq_paths(name)?,
        })
    }

    /// Device files of the enabled user work queues of `device_name`.
    fn user_wq_paths(&self, device_name: &str) -> DsaResult<Vec<PathBuf>> {
        let device_num = device_name.trim_start_matches(|c: char| c.is_ascii_alphabetic());
        let wq_prefix = format!("wq{device_num}.");

        let mut wq_names: Vec<String> = Vec::new();
        for entry in fs::read_dir(&self.sysfs)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(&wq_prefix) {
                continue;
            }
            let wq_dir = self.sysfs.join(&name);
            let state = read_sysfs_string(&wq_dir.join("state")).unwrap_or_default();
            let mode = read_sysfs_string(&wq_dir.join("type")).unwrap_or_default();
            if state == "enabled" && mode == "user" {
                wq_names.push(name);
            }
        }
        wq_names.sort();

        Ok(wq_names.iter().map(|n| self.dev.join(n)).collect())
    }
}

/// Read a sysfs attribute as a trimmed string.
pub(crate) fn read_sysfs_string(path: &Path) -> DsaResult<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// Read a sysfs attribute as a signed integer.
pub(crate) fn read_sysfs_i64(path: &Path) -> DsaResult<i64> {
    let s = read_sysfs_string(path)?;
    s.parse()
        .map_err(|_| DsaError::InvalidSysfs(format!("{}: {:?}", path.display(), s)))
}

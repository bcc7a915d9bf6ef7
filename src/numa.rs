// DSA Memory Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! NUMA topology inputs.
//!
//! The container needs three things from the platform: how many nodes
//! are configured, how many of them actually have memory, and which node
//! a given destination page currently lives on. The first two come from
//! `/sys/devices/system/node`; the last from the `get_mempolicy` syscall
//! with `MPOL_F_NODE | MPOL_F_ADDR`.

use crate::error::DsaResult;

#[cfg(target_os = "linux")]
use crate::accfg::read_sysfs_string;
#[cfg(target_os = "linux")]
use std::path::Path;

#[cfg(target_os = "linux")]
const SYSFS_NODE_PATH: &str = "/sys/devices/system/node";

/// Number of configured NUMA nodes (node directories in sysfs).
#[cfg(target_os = "linux")]
pub fn configured_nodes() -> DsaResult<usize> {
    let mut count = 0;
    for entry in std::fs::read_dir(SYSFS_NODE_PATH)? {
        let name = entry?.file_name().to_string_lossy().to_string();
        if is_node_dir(&name) {
            count += 1;
        }
    }
    Ok(count)
}

/// Highest possible node id.
#[cfg(target_os = "linux")]
pub fn max_node() -> DsaResult<usize> {
    let list = read_sysfs_string(&Path::new(SYSFS_NODE_PATH).join("possible"))?;
    Ok(parse_node_list_max(&list).unwrap_or(0))
}

/// Total memory of one node in bytes, from its `meminfo`.
#[cfg(target_os = "linux")]
pub fn node_size_bytes(node: usize) -> DsaResult<u64> {
    let path = Path::new(SYSFS_NODE_PATH)
        .join(format!("node{node}"))
        .join("meminfo");
    let text = std::fs::read_to_string(path)?;
    Ok(parse_meminfo_total_kb(&text).unwrap_or(0) * 1024)
}

/// Number of nodes (up to `max_node`) with nonzero memory.
#[cfg(target_os = "linux")]
pub fn populated_nodes() -> DsaResult<usize> {
    let mut populated = 0;
    for node in 0..=max_node()? {
        if matches!(node_size_bytes(node), Ok(size) if size > 0) {
            populated += 1;
        }
    }
    Ok(populated)
}

/// NUMA node currently backing the page at `addr`, best effort.
#[cfg(target_os = "linux")]
pub fn page_node(addr: *const u8) -> Option<usize> {
    // Not in the libc crate's exported constants; values are from
    // include/uapi/linux/mempolicy.h.
    const MPOL_F_NODE: libc::c_ulong = 1 << 0;
    const MPOL_F_ADDR: libc::c_ulong = 1 << 1;

    let mut node: libc::c_int = -1;
    let rc = unsafe {
        libc::syscall(
            libc::SYS_get_mempolicy,
            &mut node as *mut libc::c_int,
            std::ptr::null_mut::<libc::c_ulong>(),
            0 as libc::c_ulong,
            addr,
            MPOL_F_NODE | MPOL_F_ADDR,
        )
    };
    if rc == 0 && node >= 0 {
        Some(node as usize)
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
pub fn configured_nodes() -> DsaResult<usize> {
    Ok(1)
}

#[cfg(not(target_os = "linux"))]
pub fn max_node() -> DsaResult<usize> {
    Ok(0)
}

#[cfg(not(target_os = "linux"))]
pub fn node_size_bytes(_node: usize) -> DsaResult<u64> {
    Ok(0)
}

#[cfg(not(target_os = "linux"))]
pub fn populated_nodes() -> DsaResult<usize> {
    Ok(1)
}

#[cfg(not(target_os = "linux"))]
pub fn page_node(_addr: *const u8) -> Option<usize> {
    None
}

#[cfg(target_os = "linux")]
fn is_node_dir(name: &str) -> bool {
    name.strip_prefix("node")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

/// Parse the highest id from a kernel node-list string such as `0`,
/// `0-3`, or `0,2-3`.
fn parse_node_list_max(list: &str) -> Option<usize> {
    list.trim()
        .split(',')
        .filter_map(|range| range.rsplit('-').next())
        .filter_map(|id| id.trim().parse::<usize>().ok())
        .max()
}

/// Parse the `MemTotal` line of a per-node `meminfo`, in kB.
fn parse_meminfo_total_kb(text: &str) -> Option<u64> {
    for line in text.lines() {
        if let Some(rest) = line.split("MemTotal:").nth(1) {
            return rest
                .split_whitespace()
                .next()
                .and_then(|kb| kb.parse().ok());
        }
    }
    None
}

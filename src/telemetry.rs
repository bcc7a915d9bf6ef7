// DSA Memory Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Call-site telemetry.
//!
//! Candidate call sites for offload are found by counting how often each
//! site issues a primitive of a given size. One map per primitive kind;
//! the key names the call site and the size, so downstream tooling can
//! split a dumped line `<file>_<line>_<function>,<size>,<count>` on
//! commas.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Transfers below this size are not worth studying.
pub const TELEMETRY_MIN_SIZE: usize = 1024;

/// The four instrumented primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum PrimitiveKind {
    Copy = 0,
    Move = 1,
    Set = 2,
    Compare = 3,
}

const KIND_COUNT: usize = 4;

/// A captured call site. Build one with [`callsite!`](crate::callsite).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    /// Enclosing function name.
    pub function: &'static str,
    /// Source file path.
    pub file: &'static str,
    /// Source line.
    pub line: u32,
}

impl CallSite {
    /// The composite telemetry key for a call of `size` bytes.
    pub fn key(&self, size: usize) -> String {
        format!("{}_{}_{},{}", self.file, self.line, self.function, size)
    }
}

/// Capture the current call site: enclosing function, file, and line.
#[macro_export]
macro_rules! callsite {
    () => {{
        fn site() {}
        fn name_of<T>(_: T) -> &'static str {
            ::std::any::type_name::<T>()
        }
        // type_name of the local fn item is "<path>::site"; the
        // enclosing function is the path segment before it.
        let name = name_of(site);
        let name = &name[..name.len() - "::site".len()];
        let name = name.rsplit("::").next().unwrap_or(name);
        $crate::telemetry::CallSite {
            function: name,
            file: ::std::file!(),
            line: ::std::line!(),
        }
    }};
}

/// Process-wide tally of call-site × size frequencies.
#[derive(Debug, Default)]
pub struct Telemetry {
    counts: [Mutex<BTreeMap<String, u64>>; KIND_COUNT],
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one call of `size` bytes at `site`.
    pub fn record(&self, kind: PrimitiveKind, site: &CallSite, size: usize) {
        let mut counts = self.counts[kind as usize].lock().unwrap();
        *counts.entry(site.key(size)).or_insert(0) += 1;
    }

    /// Current count for an exact key.
    pub fn count(&self, kind: PrimitiveKind, key: &str) -> u64 {
        self.counts[kind as usize]
            .lock()
            .unwrap()
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Copy of one kind's map, in key order.
    pub fn snapshot(&self, kind: PrimitiveKind) -> BTreeMap<String, u64> {
        self.counts[kind as usize].lock().unwrap().clone()
    }

    /// Write one kind's map to `path`, one `<key>,<count>` record per
    /// line, no header.
    pub fn dump(&self, kind: PrimitiveKind, path: &Path) -> io::Result<()> {
        let counts = self.counts[kind as usize].lock().unwrap();
        let mut out = BufWriter::new(File::create(path)?);
        for (key, count) in counts.iter() {
            writeln!(out, "{key},{count}")?;
        }
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_site() -> CallSite {
        CallSite {
            function: "read_block",
            file: "src/cache.rs",
            line: 42,
        }
    }

    #[test]
    fn test_key_format() {
        assert_eq!(fixed_site().key(65536), "src/cache.rs_42_read_block,65536");
    }

    #[test]
    fn test_record_accumulates_per_key() {
        let telemetry = Telemetry::new();
        let site = fixed_site();

        telemetry.record(PrimitiveKind::Copy, &site, 65536);
        telemetry.record(PrimitiveKind::Copy, &site, 65536);
        telemetry.record(PrimitiveKind::Copy, &site, 4096);
        telemetry.record(PrimitiveKind::Set, &site, 65536);

        assert_eq!(telemetry.count(PrimitiveKind::Copy, &site.key(65536)), 2);
        assert_eq!(telemetry.count(PrimitiveKind::Copy, &site.key(4096)), 1);
        // Kinds are independent maps.
        assert_eq!(telemetry.count(PrimitiveKind::Set, &site.key(65536)), 1);
        assert_eq!(telemetry.count(PrimitiveKind::Move, &site.key(65536)), 0);
    }

    #[test]
    fn test_dump_round_trip() {
        let telemetry = Telemetry::new();
        let site = fixed_site();
        telemetry.record(PrimitiveKind::Copy, &site, 2048);
        telemetry.record(PrimitiveKind::Copy, &site, 2048);
        telemetry.record(PrimitiveKind::Copy, &site, 1 << 20);

        let path = std::env::temp_dir().join(format!(
            "dsa-offload-telemetry-{}.csv",
            std::process::id()
        ));
        telemetry.dump(PrimitiveKind::Copy, &path).unwrap();

        let mut parsed = BTreeMap::new();
        for line in std::fs::read_to_string(&path).unwrap().lines() {
            let (key, count) = line.rsplit_once(',').unwrap();
            parsed.insert(key.to_string(), count.parse::<u64>().unwrap());
        }
        std::fs::remove_file(&path).unwrap();

        assert_eq!(parsed, telemetry.snapshot(PrimitiveKind::Copy));
    }

    #[test]
    fn test_callsite_macro_names_enclosing_function() {
        let site = callsite!();
        assert_eq!(site.function, "test_callsite_macro_names_enclosing_function");
        assert!(site.file.ends_with("telemetry.rs"));
        assert!(site.line > 0);
    }
}

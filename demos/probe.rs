// DSA Memory Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Probe the accelerator surface and run the engine end to end.
//!
//! Run with: `cargo run --example probe`

use dsa_offload::{dsa_memcpy, dsa_memset, AccfgCtx, Container, PrimitiveKind, Status};

fn main() {
    env_logger::init();

    println!("DSA Offload Engine Probe");
    println!("========================\n");

    println!("Discovering accelerators...");
    match AccfgCtx::new().and_then(|ctx| ctx.devices()) {
        Ok(devices) if devices.is_empty() => println!("  No accelerators enumerated."),
        Ok(devices) => {
            for device in &devices {
                println!(
                    "  {}: node {}, {} user work queue(s)",
                    device.name,
                    device.numa_node,
                    device.wq_paths.len()
                );
            }
        }
        Err(e) => println!("  No accelerator context: {e}"),
    }
    println!();

    let engine = Container::global();
    let status = engine.initialize();
    println!(
        "initialize() -> {status:?}, {} device(s) usable",
        engine.device_count()
    );
    if status != Status::Ok {
        println!("  Offload disabled; primitives run on the CPU.");
    }
    println!();

    println!("Copying 1 MiB through the shim...");
    let src: Vec<u8> = (0..1 << 20).map(|i| (i % 255) as u8).collect();
    let mut dst = vec![0u8; 1 << 20];
    unsafe {
        dsa_memcpy!(dst.as_mut_ptr(), src.as_ptr(), src.len());
    }
    println!("  data matches: {}", dst == src);
    println!("  current status: {:?}", engine.current_status());
    println!();

    println!("Zero-filling 256 KiB through the shim...");
    unsafe {
        dsa_memset!(dst.as_mut_ptr(), 0, 1 << 18);
    }
    println!("  zeroed: {}", dst[..1 << 18].iter().all(|&b| b == 0));
    println!();

    let path = std::env::temp_dir().join("dsa-offload-telemetry.csv");
    match engine.telemetry().dump(PrimitiveKind::Copy, &path) {
        Ok(()) => println!("Copy telemetry dumped to {}", path.display()),
        Err(e) => println!("Telemetry dump failed: {e}"),
    }
}

/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::process::Command;

use anyhow::{ensure, Context};
use clap::{Parser, ValueEnum};

// The forwarder crate sits outside the workspace and builds against a BPF
// target with its own core, so plain `cargo build` does not cover it.
const FORWARDER_DIR: &str = "dataplane/ebpf";

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum BpfTarget {
    #[value(name = "bpfel-unknown-none")]
    LittleEndian,
    #[value(name = "bpfeb-unknown-none")]
    BigEndian,
}

impl BpfTarget {
    pub fn triple(self) -> &'static str {
        match self {
            BpfTarget::LittleEndian => "bpfel-unknown-none",
            BpfTarget::BigEndian => "bpfeb-unknown-none",
        }
    }
}

#[derive(Debug, Parser)]
pub struct Options {
    /// Endianness of the BPF target
    #[clap(default_value = "bpfel-unknown-none", long, value_enum)]
    pub target: BpfTarget,
    /// Build the release target
    #[clap(long)]
    pub release: bool,
}

pub fn build_ebpf(opts: Options) -> Result<(), anyhow::Error> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(FORWARDER_DIR)
        .args(["+nightly", "build", "--verbose", "-Z", "build-std=core"])
        .arg(format!("--target={}", opts.target.triple()));
    if opts.release {
        cmd.arg("--release");
    }

    let status = cmd
        .status()
        .with_context(|| format!("failed to run cargo in {FORWARDER_DIR}"))?;
    ensure!(status.success(), "forwarder build failed: {status}");
    Ok(())
}

/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::{os::unix::process::CommandExt, process::Command};

use anyhow::{ensure, Context as _};
use clap::Parser;

#[cfg(target_os = "linux")]
use crate::build_ebpf::{build_ebpf, BpfTarget, Options as BuildOptions};

#[derive(Debug, Parser)]
pub struct Options {
    /// Endianness of the BPF target
    #[cfg(target_os = "linux")]
    #[clap(default_value = "bpfel-unknown-none", long, value_enum)]
    pub bpf_target: BpfTarget,
    /// Build and run the release target
    #[clap(long)]
    pub release: bool,
    /// The command used to wrap your application
    #[clap(short, long, default_value = "sudo -E")]
    pub runner: String,
    /// Arguments to pass to your application
    #[clap(name = "args", last = true)]
    pub run_args: Vec<String>,
}

fn build_package(package: &str, release: bool) -> Result<(), anyhow::Error> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "--package", package]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .with_context(|| format!("failed to run cargo for {package}"))?;
    ensure!(status.success(), "building {package} failed: {status}");
    Ok(())
}

fn binary_path(binary: &str, release: bool) -> String {
    let profile = if release { "release" } else { "debug" };
    format!("target/{profile}/{binary}")
}

/// Build the forwarder and the loader, then exec the loader under the
/// configured runner (the loader needs privileges to attach XDP programs).
#[cfg(target_os = "linux")]
pub fn dataplane(opts: Options) -> Result<(), anyhow::Error> {
    build_ebpf(BuildOptions {
        target: opts.bpf_target,
        release: opts.release,
    })
    .context("Error while building eBPF program")?;
    build_package("loader", opts.release)?;

    let bin_path = binary_path("loader", opts.release);

    let mut wrapper = opts.runner.split_whitespace();
    let program = wrapper.next().context("--runner must not be empty")?;
    let err = Command::new(program)
        .args(wrapper)
        .arg(&bin_path)
        .args(&opts.run_args)
        .env("RUST_LOG", "info,api_server=debug")
        .exec();

    // exec only returns on failure
    Err(anyhow::Error::from(err).context(format!("Failed to run `{bin_path}`")))
}

/// Build and exec the controlplane controller.
pub fn controlplane(opts: Options) -> Result<(), anyhow::Error> {
    build_package("controlplane", opts.release)?;

    let bin_path = binary_path("controller", opts.release);
    let err = Command::new(&bin_path)
        .args(&opts.run_args)
        .env("RUST_LOG", "info")
        .exec();

    // exec only returns on failure
    Err(anyhow::Error::from(err).context(format!("Failed to run `{bin_path}`")))
}

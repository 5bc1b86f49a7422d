/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

#[cfg(target_os = "linux")]
mod build_ebpf;
mod build_proto;
mod grpc;
mod run;

use clap::Parser;

#[derive(Debug, Parser)]
#[clap(name = "xtask", about = "development tasks for this repository")]
enum Command {
    /// Compile the in-kernel forwarder for a BPF target
    #[cfg(target_os = "linux")]
    BuildEbpf(build_ebpf::Options),
    /// Build and run the dataplane loader on this machine
    #[cfg(target_os = "linux")]
    RunDataplane(run::Options),
    /// Build and run the controlplane controller
    RunControlplane(run::Options),
    /// Regenerate the committed gRPC code from the proto definition
    BuildProto(build_proto::Options),
    /// Poke a running node agent over gRPC
    GrpcClient(grpc::Options),
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    match Command::parse() {
        #[cfg(target_os = "linux")]
        Command::BuildEbpf(opts) => build_ebpf::build_ebpf(opts),
        #[cfg(target_os = "linux")]
        Command::RunDataplane(opts) => run::dataplane(opts),
        Command::RunControlplane(opts) => run::controlplane(opts),
        Command::BuildProto(opts) => build_proto::build_proto(opts),
        Command::GrpcClient(opts) => grpc::update(opts).await,
    }
}

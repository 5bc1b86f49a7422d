/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::env;
use std::fs;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Context;
use api_server::config::TLSConfig;
use api_server::routing::{watch_pods, RoutingTable};
use api_server::{start as start_api_server, DATAPLANE_API_PORT};
use aya::maps::HashMap;
use aya::programs::{Xdp, XdpFlags};
use aya::Ebpf;
use aya_log::EbpfLogger;
use clap::Parser;
use common::{Backend, VipKey};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
struct Opt {
    /// The data-plane network interface the forwarder attaches to.
    #[clap(short, long, default_value = "lo")]
    iface: String,
    /// Interfaces to attach the cooperative pass-through program to, for
    /// kernels that require a program on redirect targets.
    #[clap(long = "peer-iface")]
    peer_ifaces: Vec<String>,
    /// Path to the compiled forwarder object.
    #[clap(
        long,
        default_value = "dataplane/ebpf/target/bpfel-unknown-none/release/forwarder"
    )]
    bpf_path: String,
    #[clap(subcommand)]
    tls: Option<TLSConfig>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();

    // The eBPF logger emits through the `log` facade; the fmt subscriber
    // picks those records up alongside our own.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("loading ebpf programs from {}", &opt.bpf_path);

    let bytes = fs::read(&opt.bpf_path)
        .with_context(|| format!("failed to read eBPF object at {}", opt.bpf_path))?;
    let mut bpf = Ebpf::load(&bytes)?;
    if let Err(e) = EbpfLogger::init(&mut bpf) {
        warn!("failed to initialize eBPF logger: {}", e);
    }

    info!("attaching xdp_ingress program to {}", &opt.iface);

    let ingress_program: &mut Xdp = bpf
        .program_mut("xdp_ingress")
        .expect("no program named xdp_ingress")
        .try_into()?;
    ingress_program.load()?;
    ingress_program
        .attach(&opt.iface, XdpFlags::default())
        .context("failed to attach the ingress XDP program")?;

    if !opt.peer_ifaces.is_empty() {
        let pass_program: &mut Xdp = bpf
            .program_mut("xdp_pass")
            .expect("no program named xdp_pass")
            .try_into()?;
        pass_program.load()?;
        for iface in &opt.peer_ifaces {
            info!("attaching xdp_pass program to {}", iface);
            pass_program
                .attach(iface, XdpFlags::default())
                .with_context(|| format!("failed to attach the pass program to {}", iface))?;
        }
    }

    let backends: HashMap<_, VipKey, Backend> =
        HashMap::try_from(bpf.take_map("BACKENDS").expect("no map named BACKENDS"))?;

    info!("starting pod watcher");

    let routing = Arc::new(RoutingTable::new());
    let node_name =
        env::var("NODE_NAME").context("NODE_NAME environment variable is not set")?;
    let client = kube::Client::try_default()
        .await
        .context("failed to create kube client")?;
    {
        let routing = routing.clone();
        tokio::spawn(async move {
            if let Err(err) = watch_pods(client, node_name, routing).await {
                error!("pod watcher failed: {}", err);
            }
        });
    }

    info!("starting api server");

    start_api_server(
        Ipv4Addr::new(0, 0, 0, 0),
        DATAPLANE_API_PORT,
        backends,
        routing,
        opt.tls,
    )
    .await?;

    info!("Exiting...");

    Ok(())
}

/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

#![no_std]
#![no_main]

mod ingress;
mod utils;

use aya_ebpf::{
    bindings::xdp_action,
    macros::{map, xdp},
    maps::{HashMap, PerCpuArray},
    programs::XdpContext,
};

use network_types::{
    eth::{EthHdr, EtherType},
    ip::{IpProto, Ipv4Hdr},
};

use common::{Backend, VipKey, BACKENDS_MAP_CAPACITY};
use ingress::{tcp::handle_tcp_ingress, udp::handle_udp_ingress};
use utils::ptr_at;

// -----------------------------------------------------------------------------
// Maps
// -----------------------------------------------------------------------------

#[map(name = "BACKENDS")]
static BACKENDS: HashMap<VipKey, Backend> =
    HashMap::<VipKey, Backend>::with_max_entries(BACKENDS_MAP_CAPACITY, 0);

#[map(name = "PASS_PKTS")]
static PASS_PKTS: PerCpuArray<u64> = PerCpuArray::with_max_entries(1, 0);

// -----------------------------------------------------------------------------
// Ingress
// -----------------------------------------------------------------------------

#[xdp]
pub fn xdp_ingress(ctx: XdpContext) -> u32 {
    match try_xdp_ingress(&ctx) {
        Ok(action) => action,
        // Only boundary violations land here; drop and count.
        Err(_) => xdp_action::XDP_ABORTED,
    }
}

fn try_xdp_ingress(ctx: &XdpContext) -> Result<u32, ()> {
    let eth_hdr: *const EthHdr = ptr_at(ctx, 0)?;

    if unsafe { (*eth_hdr).ether_type } != EtherType::Ipv4 {
        return Ok(xdp_action::XDP_PASS);
    }

    let ip_hdr: *const Ipv4Hdr = ptr_at(ctx, EthHdr::LEN)?;

    match unsafe { (*ip_hdr).proto } {
        IpProto::Tcp => handle_tcp_ingress(ctx),
        IpProto::Udp => handle_udp_ingress(ctx),
        _ => Ok(xdp_action::XDP_PASS),
    }
}

// -----------------------------------------------------------------------------
// Cooperative pass-through
// -----------------------------------------------------------------------------

// Attached to redirect target interfaces on kernels that require a program on
// both ends of a redirect pair; counts what it sees and hands everything to
// the stack.
#[xdp]
pub fn xdp_pass(_ctx: XdpContext) -> u32 {
    if let Some(count) = PASS_PKTS.get_ptr_mut(0) {
        unsafe { *count += 1 };
    }
    xdp_action::XDP_PASS
}

// -----------------------------------------------------------------------------
// Panic Implementation
// -----------------------------------------------------------------------------

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

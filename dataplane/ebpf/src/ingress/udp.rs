/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use aya_ebpf::{bindings::xdp_action, helpers::bpf_redirect, programs::XdpContext};
use aya_log_ebpf::{debug, info};

use network_types::{
    eth::EthHdr,
    ip::{IpProto, Ipv4Hdr},
    udp::UdpHdr,
};

use crate::{
    utils::{ipv4_header_csum, l4_csum_sum, ptr_at, CSUM_PAYLOAD_CAP},
    BACKENDS,
};
use common::{csum, VipKey};

pub fn handle_udp_ingress(ctx: &XdpContext) -> Result<u32, ()> {
    let eth_hdr: *mut EthHdr = ptr_at(ctx, 0)?;
    let ip_hdr: *mut Ipv4Hdr = ptr_at(ctx, EthHdr::LEN)?;
    let udp_hdr: *mut UdpHdr = ptr_at(ctx, EthHdr::LEN + Ipv4Hdr::LEN)?;

    let key = VipKey::new(
        u32::from_be(unsafe { (*ip_hdr).dst_addr }),
        u16::from_be(unsafe { (*udp_hdr).dest }),
    );
    let backend = match unsafe { BACKENDS.get(&key) } {
        Some(bk) => *bk,
        None => return Ok(xdp_action::XDP_PASS),
    };

    info!(
        ctx,
        "received a UDP packet destined for svc ip: {:i} at port: {}", key.vip, key.port,
    );

    // A datagram that claims less than a header or more than the frame holds
    // is not ours to fix.
    let udp_len = u16::from_be(unsafe { (*udp_hdr).len });
    let l4_off = EthHdr::LEN + Ipv4Hdr::LEN;
    if (udp_len as usize) < UdpHdr::LEN
        || ctx.data() + l4_off + udp_len as usize > ctx.data_end()
    {
        return Ok(xdp_action::XDP_PASS);
    }

    unsafe {
        (*ip_hdr).src_addr = backend.saddr.to_be();
        (*ip_hdr).dst_addr = backend.daddr.to_be();
        if key.port != backend.dport {
            (*udp_hdr).dest = backend.dport.to_be();
        }
        (*eth_hdr).src_addr = backend.src_mac;
        (*eth_hdr).dst_addr = backend.dst_mac;
    }

    unsafe { (*ip_hdr).check = 0 };
    let ip_csum = ipv4_header_csum(ctx, EthHdr::LEN)?;
    unsafe { (*ip_hdr).check = ip_csum.to_be() };

    // Zero is a legal UDP checksum on IPv4, so it doubles as the escape
    // valve when recomputation is suppressed or the payload outgrows the
    // walk cap.
    if backend.nocksum == 0 && (udp_len as usize) <= CSUM_PAYLOAD_CAP {
        unsafe { (*udp_hdr).check = 0 };
        let sum = l4_csum_sum(ctx, ip_hdr, l4_off, udp_len, IpProto::Udp as u8)?;
        unsafe { (*udp_hdr).check = csum::fold_udp(sum).to_be() };
    } else {
        unsafe { (*udp_hdr).check = 0 };
    }

    let action = unsafe { bpf_redirect(backend.ifindex as u32, 0) };
    debug!(ctx, "redirect action: {}", action);
    if action != xdp_action::XDP_REDIRECT as i64 {
        return Ok(xdp_action::XDP_PASS);
    }

    Ok(xdp_action::XDP_REDIRECT)
}

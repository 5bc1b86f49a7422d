/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use aya_ebpf::{bindings::xdp_action, helpers::bpf_redirect, programs::XdpContext};
use aya_log_ebpf::{debug, info};

use network_types::{
    eth::EthHdr,
    ip::{IpProto, Ipv4Hdr},
    tcp::TcpHdr,
};

use crate::{
    utils::{ipv4_header_csum, l4_csum_sum, ptr_at, CSUM_PAYLOAD_CAP},
    BACKENDS,
};
use common::{csum, VipKey};

pub fn handle_tcp_ingress(ctx: &XdpContext) -> Result<u32, ()> {
    let eth_hdr: *mut EthHdr = ptr_at(ctx, 0)?;
    let ip_hdr: *mut Ipv4Hdr = ptr_at(ctx, EthHdr::LEN)?;
    let tcp_hdr: *mut TcpHdr = ptr_at(ctx, EthHdr::LEN + Ipv4Hdr::LEN)?;

    let key = VipKey::new(
        u32::from_be(unsafe { (*ip_hdr).dst_addr }),
        u16::from_be(unsafe { (*tcp_hdr).dest }),
    );
    let backend = match unsafe { BACKENDS.get(&key) } {
        Some(bk) => *bk,
        None => return Ok(xdp_action::XDP_PASS),
    };

    info!(
        ctx,
        "received a TCP packet destined for svc ip: {:i} at port: {}", key.vip, key.port,
    );

    // The TCP checksum is mandatory, so the segment length has to be sound
    // and within the walk cap before any header is touched. A well-formed
    // Ethernet frame never exceeds the cap.
    let tot_len = u16::from_be(unsafe { (*ip_hdr).tot_len });
    let l4_len = match tot_len.checked_sub(Ipv4Hdr::LEN as u16) {
        Some(len) if len as usize >= TcpHdr::LEN => len,
        _ => return Ok(xdp_action::XDP_PASS),
    };
    let l4_off = EthHdr::LEN + Ipv4Hdr::LEN;
    if ctx.data() + EthHdr::LEN + tot_len as usize > ctx.data_end()
        || l4_len as usize > CSUM_PAYLOAD_CAP
    {
        return Ok(xdp_action::XDP_PASS);
    }

    unsafe {
        (*ip_hdr).src_addr = backend.saddr.to_be();
        (*ip_hdr).dst_addr = backend.daddr.to_be();
        if key.port != backend.dport {
            (*tcp_hdr).dest = backend.dport.to_be();
        }
        (*eth_hdr).src_addr = backend.src_mac;
        (*eth_hdr).dst_addr = backend.dst_mac;
    }

    unsafe { (*ip_hdr).check = 0 };
    let ip_csum = ipv4_header_csum(ctx, EthHdr::LEN)?;
    unsafe { (*ip_hdr).check = ip_csum.to_be() };

    unsafe { (*tcp_hdr).check = 0 };
    let sum = l4_csum_sum(ctx, ip_hdr, l4_off, l4_len, IpProto::Tcp as u8)?;
    unsafe { (*tcp_hdr).check = csum::fold(sum).to_be() };

    let action = unsafe { bpf_redirect(backend.ifindex as u32, 0) };
    debug!(ctx, "redirect action: {}", action);
    if action != xdp_action::XDP_REDIRECT as i64 {
        return Ok(xdp_action::XDP_PASS);
    }

    Ok(xdp_action::XDP_REDIRECT)
}

/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use core::mem;

use aya_ebpf::programs::XdpContext;
use network_types::ip::Ipv4Hdr;

use common::csum;

// Bound for the transport checksum walk. Large enough for a full segment on
// a standard 1500-byte MTU, small enough for the verifier to unroll.
pub const CSUM_PAYLOAD_CAP: usize = 1480;

// Gives us a raw pointer to a specific offset in the packet, or Err if the
// type would extend past data_end.
#[inline(always)]
pub fn ptr_at<T>(ctx: &XdpContext, offset: usize) -> Result<*mut T, ()> {
    let start = ctx.data();
    let end = ctx.data_end();
    let len = mem::size_of::<T>();

    if start + offset + len > end {
        return Err(());
    }
    Ok((start + offset) as *mut T)
}

// Recomputes the IPv4 header checksum over the 20-byte header at `ip_off`.
// The caller zeroes the check field first.
#[inline(always)]
pub fn ipv4_header_csum(ctx: &XdpContext, ip_off: usize) -> Result<u16, ()> {
    let mut sum = 0u64;
    for i in 0..(Ipv4Hdr::LEN / 2) {
        let word: *const u16 = ptr_at(ctx, ip_off + i * 2)?;
        sum += u16::from_be(unsafe { *word }) as u64;
    }
    Ok(csum::fold(sum))
}

// One's-complement sum of pseudo-header plus transport header and payload,
// starting at `l4_off` for `l4_len` bytes. The caller zeroes the transport
// checksum field first, bounds `l4_len` by CSUM_PAYLOAD_CAP, and folds the
// result. Walks two bytes at a time; an odd trailing byte is zero-padded.
#[inline(always)]
pub fn l4_csum_sum(
    ctx: &XdpContext,
    ip_hdr: *const Ipv4Hdr,
    l4_off: usize,
    l4_len: u16,
    protocol: u8,
) -> Result<u64, ()> {
    let (saddr, daddr) = unsafe { ((*ip_hdr).src_addr, (*ip_hdr).dst_addr) };
    let mut sum = csum::pseudo_header_sum(saddr, daddr, protocol, l4_len);

    let base = ctx.data() + l4_off;
    let end = ctx.data_end();
    let len = l4_len as usize;

    let mut i = 0usize;
    for _ in 0..(CSUM_PAYLOAD_CAP / 2) {
        if i + 2 > len {
            break;
        }
        let off = base + i;
        if off + 2 > end {
            return Err(());
        }
        sum += u16::from_be(unsafe { *(off as *const u16) }) as u64;
        i += 2;
    }
    if i < len {
        let off = base + i;
        if off + 1 > end {
            return Err(());
        }
        sum += (unsafe { *(off as *const u8) } as u64) << 8;
    }

    Ok(sum)
}

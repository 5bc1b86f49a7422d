/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

#![no_std]

pub mod csum;

/// Capacity of the BACKENDS forwarding map. A load-time tunable, not a
/// semantic limit.
pub const BACKENDS_MAP_CAPACITY: u32 = 128;

/// Forwarding-table key: one virtual IP and listener port pair.
///
/// Integer fields are host byte order; the packet path converts from network
/// byte order as it parses. The trailing pad keeps the layout explicit so the
/// key round-trips through the kernel map ABI bytewise.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct VipKey {
    pub vip: u32,
    pub port: u16,
    pub _pad: [u8; 2],
}

impl VipKey {
    pub const fn new(vip: u32, port: u16) -> Self {
        Self {
            vip,
            port,
            _pad: [0; 2],
        }
    }
}

/// Forwarding-table value: everything the packet path needs to rewrite and
/// redirect one frame.
///
/// `saddr` replaces the packet's source address (the gateway VIP), `daddr`
/// and `dport` select the pod endpoint, the MAC pair is the L2 rewrite for
/// the veth on this node, and `ifindex` is the redirect target. A non-zero
/// `nocksum` suppresses the UDP checksum recompute (RFC 768 permits a zero
/// checksum on IPv4); the TCP path ignores it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Backend {
    pub saddr: u32,
    pub daddr: u32,
    pub dport: u16,
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub ifindex: u16,
    pub nocksum: u8,
    pub _pad: [u8; 3],
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for VipKey {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for Backend {}

// The kernel program and the map writers in userspace must agree on these
// layouts exactly.
const _: () = {
    use core::mem::{offset_of, size_of};
    assert!(size_of::<VipKey>() == 8);
    assert!(offset_of!(VipKey, vip) == 0);
    assert!(offset_of!(VipKey, port) == 4);

    assert!(size_of::<Backend>() == 28);
    assert!(offset_of!(Backend, saddr) == 0);
    assert!(offset_of!(Backend, daddr) == 4);
    assert!(offset_of!(Backend, dport) == 8);
    assert!(offset_of!(Backend, src_mac) == 10);
    assert!(offset_of!(Backend, dst_mac) == 16);
    assert!(offset_of!(Backend, ifindex) == 22);
    assert!(offset_of!(Backend, nocksum) == 24);
};

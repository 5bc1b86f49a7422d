/*
Copyright 2025 The Kubernetes Authors.

SPDX-License-Identifier: (GPL-2.0-only OR BSD-2-Clause)
*/

use std::net::Ipv4Addr;

use anyhow::Error;
use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_DUMP_FILTERED, NLM_F_REQUEST,
};
use netlink_packet_route::{
    link::{LinkAttribute, LinkMessage},
    neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage},
    route::{RouteAddress, RouteAttribute, RouteFlags, RouteHeader, RouteMessage},
    AddressFamily, RouteNetlinkMessage,
};
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};

fn netlink_request(
    message: RouteNetlinkMessage,
    flags: u16,
) -> Result<(Socket, Vec<u8>), Error> {
    let mut socket = Socket::new(NETLINK_ROUTE)?;
    socket.bind_auto()?;
    socket.connect(&SocketAddr::new(0, 0))?;

    let mut nl_hdr = NetlinkHeader::default();
    nl_hdr.flags = flags;

    let mut packet = NetlinkMessage::new(nl_hdr, NetlinkPayload::from(message));
    packet.finalize();
    let mut buf = vec![0; packet.header.length as usize];
    if buf.len() != packet.buffer_len() {
        return Err(Error::msg("construct packet failed"));
    }
    packet.serialize(&mut buf[..]);
    socket
        .send(&buf[..], 0)
        .map_err(|_| Error::msg("netlink send message failed"))?;

    Ok((socket, vec![0; 4096]))
}

/// Returns a net interface index for an IPv4 address, like `ip route get to`.
pub fn if_index_for_routing_ip(ip_addr: Ipv4Addr) -> Result<u32, Error> {
    let route_header = RouteHeader {
        address_family: AddressFamily::Inet,
        flags: RouteFlags::LookupTable,
        destination_prefix_length: 32,
        table: RouteHeader::RT_TABLE_MAIN,
        ..Default::default()
    };
    let mut route_message = RouteMessage::default();
    route_message.header = route_header;
    route_message.attributes = vec![RouteAttribute::Destination(RouteAddress::Inet(ip_addr))];

    let no_device_err: String = format!("no device found to route {}", ip_addr);

    let (mut socket, mut receive_buffer) = netlink_request(
        RouteNetlinkMessage::GetRoute(route_message),
        NLM_F_REQUEST | NLM_F_DUMP_FILTERED,
    )?;
    socket
        .recv(&mut &mut receive_buffer[..], 0)
        .map_err(|_| Error::msg("netlink receive message failed"))?;

    let (_, payload) = <NetlinkMessage<RouteNetlinkMessage>>::deserialize(&receive_buffer[..])
        .map_err(|_| Error::msg(no_device_err.clone()))?
        .into_parts();
    match payload {
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewRoute(route)) => {
            if let Some(RouteAttribute::Oif(ifindex)) = route
                .attributes
                .iter()
                .find(|attr| matches!(attr, RouteAttribute::Oif(_)))
            {
                return Ok(*ifindex);
            }
            Err(Error::msg(no_device_err))
        }
        _ => Err(Error::msg(no_device_err)),
    }
}

/// Returns the hardware address of the neighbour entry for `ip_addr` on the
/// interface `ifindex`, like `ip neigh show dev <if>`.
pub fn mac_for_neighbor(ifindex: u32, ip_addr: Ipv4Addr) -> Result<[u8; 6], Error> {
    let mut neigh_message = NeighbourMessage::default();
    neigh_message.header.family = AddressFamily::Inet;

    let no_neigh_err: String = format!("no neighbour entry for {}", ip_addr);

    let (mut socket, mut receive_buffer) = netlink_request(
        RouteNetlinkMessage::GetNeighbour(neigh_message),
        NLM_F_REQUEST | NLM_F_DUMP,
    )?;

    loop {
        let size = socket
            .recv(&mut &mut receive_buffer[..], 0)
            .map_err(|_| Error::msg("netlink receive message failed"))?;
        if size == 0 {
            break;
        }

        let mut offset = 0;
        while offset < size {
            let message =
                <NetlinkMessage<RouteNetlinkMessage>>::deserialize(&receive_buffer[offset..])
                    .map_err(|_| Error::msg("netlink message parse failed"))?;
            let length = message.header.length as usize;
            let (_, payload) = message.into_parts();

            match payload {
                NetlinkPayload::Done(_) => return Err(Error::msg(no_neigh_err)),
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewNeighbour(neigh)) => {
                    if neigh.header.ifindex == ifindex {
                        let matches_addr = neigh.attributes.iter().any(|attr| {
                            matches!(
                                attr,
                                NeighbourAttribute::Destination(NeighbourAddress::Inet(addr))
                                    if *addr == ip_addr
                            )
                        });
                        if matches_addr {
                            if let Some(NeighbourAttribute::LinkLocalAddress(lladdr)) = neigh
                                .attributes
                                .iter()
                                .find(|attr| matches!(attr, NeighbourAttribute::LinkLocalAddress(_)))
                            {
                                return mac_from_bytes(lladdr);
                            }
                        }
                    }
                }
                NetlinkPayload::Error(err) => {
                    return Err(Error::msg(format!("netlink error: {}", err)))
                }
                _ => {}
            }

            if length == 0 {
                break;
            }
            offset += length;
        }
    }

    Err(Error::msg(no_neigh_err))
}

/// Returns the hardware address of the interface `ifindex`, like
/// `ip link show`.
pub fn mac_for_interface(ifindex: u32) -> Result<[u8; 6], Error> {
    let mut link_message = LinkMessage::default();
    link_message.header.index = ifindex;

    let no_link_err: String = format!("no link with index {}", ifindex);

    let (mut socket, mut receive_buffer) =
        netlink_request(RouteNetlinkMessage::GetLink(link_message), NLM_F_REQUEST)?;
    socket
        .recv(&mut &mut receive_buffer[..], 0)
        .map_err(|_| Error::msg("netlink receive message failed"))?;

    let (_, payload) = <NetlinkMessage<RouteNetlinkMessage>>::deserialize(&receive_buffer[..])
        .map_err(|_| Error::msg(no_link_err.clone()))?
        .into_parts();
    match payload {
        NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
            if let Some(LinkAttribute::Address(address)) = link
                .attributes
                .iter()
                .find(|attr| matches!(attr, LinkAttribute::Address(_)))
            {
                return mac_from_bytes(address);
            }
            Err(Error::msg(no_link_err))
        }
        NetlinkPayload::Error(err) => Err(Error::msg(format!("netlink error: {}", err))),
        _ => Err(Error::msg(no_link_err)),
    }
}

fn mac_from_bytes(bytes: &[u8]) -> Result<[u8; 6], Error> {
    bytes
        .try_into()
        .map_err(|_| Error::msg(format!("unexpected hardware address length {}", bytes.len())))
}

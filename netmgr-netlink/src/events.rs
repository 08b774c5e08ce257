//! Typed kernel events.
//!
//! Raw rtnetlink messages are decoded here into the small event vocabulary
//! the network state engine consumes. Everything the engine needs from a
//! link message is captured in [`LinkSnapshot`] so the same type serves both
//! the notification stream and one-shot link dumps.

use std::net::IpAddr;

use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkMessage, State};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};

use netmgr_common::types::MacAddr;

/// Address family of a link or address message, as the engine cares about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFamily {
    Unspec,
    Inet,
    Inet6,
    Bridge,
    Other,
}

impl LinkFamily {
    fn from_kernel(family: AddressFamily) -> Self {
        match family {
            AddressFamily::Unspec => LinkFamily::Unspec,
            AddressFamily::Inet => LinkFamily::Inet,
            AddressFamily::Inet6 => LinkFamily::Inet6,
            AddressFamily::Bridge => LinkFamily::Bridge,
            _ => LinkFamily::Other,
        }
    }
}

impl std::fmt::Display for LinkFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkFamily::Unspec => "UNSPEC",
            LinkFamily::Inet => "INET",
            LinkFamily::Inet6 => "INET6",
            LinkFamily::Bridge => "BRIDGE",
            LinkFamily::Other => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Kernel operational state of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OperState {
    Up,
    Down,
    Dormant,
    #[default]
    Unknown,
}

impl OperState {
    fn from_kernel(state: State) -> Self {
        match state {
            State::Up => OperState::Up,
            State::Down => OperState::Down,
            State::Dormant => OperState::Dormant,
            _ => OperState::Unknown,
        }
    }
}

/// Everything the engine keeps from one link message.
#[derive(Debug, Clone, Default)]
pub struct LinkSnapshot {
    pub index: u32,
    pub name: Option<String>,
    pub family: LinkFamily,
    /// Raw IFF_* flag bits.
    pub flags: u32,
    /// Raw IFF_* change mask; all-ones means the link was removed outright.
    pub change_mask: u32,
    pub mac: Option<MacAddr>,
    pub oper_state: OperState,
    /// Index of the bridge that captured this link, from an AF_BRIDGE message.
    pub bridge_index: Option<u32>,
    /// ARPHRD_* link layer type.
    pub link_type: u16,
}

impl Default for LinkFamily {
    fn default() -> Self {
        LinkFamily::Unspec
    }
}

/// An address added to or removed from a link.
#[derive(Debug, Clone)]
pub struct AddressEvent {
    pub index: u32,
    pub family: LinkFamily,
    pub address: Option<IpAddr>,
    pub prefix_len: u8,
}

/// A typed kernel notification.
#[derive(Debug, Clone)]
pub enum Event {
    LinkAdded(LinkSnapshot),
    LinkRemoved(LinkSnapshot),
    AddressAdded(AddressEvent),
    AddressRemoved(AddressEvent),
}

/// Decode one link message into a snapshot.
pub fn decode_link(msg: &LinkMessage) -> LinkSnapshot {
    let mut snapshot = LinkSnapshot {
        index: msg.header.index,
        family: LinkFamily::from_kernel(msg.header.interface_family),
        flags: msg.header.flags.bits(),
        change_mask: msg.header.change_mask.bits(),
        link_type: u16::from(msg.header.link_layer_type),
        ..Default::default()
    };

    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => snapshot.name = Some(name.clone()),
            LinkAttribute::Address(bytes) => {
                if bytes.len() == 6 {
                    let mut mac = [0u8; 6];
                    mac.copy_from_slice(bytes);
                    snapshot.mac = Some(MacAddr(mac));
                }
            }
            LinkAttribute::OperState(state) => {
                snapshot.oper_state = OperState::from_kernel(*state);
            }
            LinkAttribute::Controller(index) => snapshot.bridge_index = Some(*index),
            _ => {}
        }
    }

    snapshot
}

fn decode_address(msg: &AddressMessage) -> AddressEvent {
    let mut address = None;
    for attr in &msg.attributes {
        match attr {
            AddressAttribute::Address(addr) => address = Some(*addr),
            AddressAttribute::Local(addr) => {
                if address.is_none() {
                    address = Some(*addr);
                }
            }
            _ => {}
        }
    }
    AddressEvent {
        index: msg.header.index,
        family: LinkFamily::from_kernel(msg.header.family),
        address,
        prefix_len: msg.header.prefix_len,
    }
}

/// Decode one rtnetlink message into a typed event, or `None` for message
/// types the engine does not consume.
pub fn decode(msg: &NetlinkMessage<RouteNetlinkMessage>) -> Option<Event> {
    let inner = match &msg.payload {
        NetlinkPayload::InnerMessage(inner) => inner,
        _ => return None,
    };

    match inner {
        RouteNetlinkMessage::NewLink(link) => Some(Event::LinkAdded(decode_link(link))),
        RouteNetlinkMessage::DelLink(link) => Some(Event::LinkRemoved(decode_link(link))),
        RouteNetlinkMessage::NewAddress(addr) => Some(Event::AddressAdded(decode_address(addr))),
        RouteNetlinkMessage::DelAddress(addr) => Some(Event::AddressRemoved(decode_address(addr))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlink_packet_route::link::LinkFlags;

    #[test]
    fn test_decode_link_snapshot() {
        let mut msg = LinkMessage::default();
        msg.header.index = 3;
        msg.header.flags = LinkFlags::Up | LinkFlags::Running;
        msg.attributes.push(LinkAttribute::IfName("biz0".into()));
        msg.attributes
            .push(LinkAttribute::Address(vec![0x02, 0, 0, 0, 0, 0xaa]));
        msg.attributes.push(LinkAttribute::OperState(State::Up));

        let snapshot = decode_link(&msg);
        assert_eq!(snapshot.index, 3);
        assert_eq!(snapshot.name.as_deref(), Some("biz0"));
        assert_eq!(snapshot.mac, Some(MacAddr([0x02, 0, 0, 0, 0, 0xaa])));
        assert_eq!(snapshot.oper_state, OperState::Up);
        assert_ne!(snapshot.flags & libc::IFF_UP as u32, 0);
    }

    #[test]
    fn test_decode_new_link_event() {
        let mut link = LinkMessage::default();
        link.header.index = 7;
        let msg = NetlinkMessage::from(RouteNetlinkMessage::NewLink(link));
        match decode(&msg) {
            Some(Event::LinkAdded(snapshot)) => assert_eq!(snapshot.index, 7),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_decode_address_event() {
        let mut addr = AddressMessage::default();
        addr.header.index = 3;
        addr.header.family = AddressFamily::Inet6;
        addr.header.prefix_len = 64;
        addr.attributes.push(AddressAttribute::Address(
            "fe80::ff:fe00:aa".parse().unwrap(),
        ));
        let msg = NetlinkMessage::from(RouteNetlinkMessage::DelAddress(addr));
        match decode(&msg) {
            Some(Event::AddressRemoved(event)) => {
                assert_eq!(event.index, 3);
                assert_eq!(event.family, LinkFamily::Inet6);
                assert_eq!(event.prefix_len, 64);
                assert_eq!(event.address, Some("fe80::ff:fe00:aa".parse().unwrap()));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

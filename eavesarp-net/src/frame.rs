//! Ethernet+ARP frame construction (spec.md §4.2: "hardware size 6,
//! protocol size 4").

use std::net::Ipv4Addr;

use pnet::util::MacAddr;
use pnet_packet::arp::{ArpHardwareTypes, ArpOperation, ArpOperations, MutableArpPacket};
use pnet_packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet_packet::Packet;

use eavesarp_core::error::{Error, Result};

const ETHERNET_HEADER_LEN: usize = 14;
const ARP_PACKET_LEN: usize = 28;

/// Builds a serialised Ethernet frame carrying an ARP request or reply.
///
/// A request with an unknown target hardware address uses the Ethernet
/// broadcast destination and a zero ARP target hardware address. A reply
/// requires a known target hardware address; absent one, returns
/// `Error::InvalidReply`.
pub fn build_arp_frame(
    operation: ArpOperation,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: Option<MacAddr>,
    target_ip: Ipv4Addr,
) -> Result<Vec<u8>> {
    if operation == ArpOperations::Reply && target_mac.is_none() {
        return Err(Error::InvalidReply);
    }

    let eth_dst = target_mac.unwrap_or(MacAddr::broadcast());
    let arp_target_hw = target_mac.unwrap_or(MacAddr::zero());

    let mut buf = vec![0u8; ETHERNET_HEADER_LEN + ARP_PACKET_LEN];
    let (eth_buf, arp_buf) = buf.split_at_mut(ETHERNET_HEADER_LEN);

    let mut eth_packet = MutableEthernetPacket::new(eth_buf).expect("buffer sized for ethernet header");
    eth_packet.set_destination(eth_dst);
    eth_packet.set_source(sender_mac);
    eth_packet.set_ethertype(EtherTypes::Arp);

    let mut arp_packet = MutableArpPacket::new(arp_buf).expect("buffer sized for arp packet");
    arp_packet.set_hardware_type(ArpHardwareTypes::Ethernet);
    arp_packet.set_protocol_type(EtherTypes::Ipv4);
    arp_packet.set_hw_addr_len(6);
    arp_packet.set_proto_addr_len(4);
    arp_packet.set_operation(operation);
    arp_packet.set_sender_hw_addr(sender_mac);
    arp_packet.set_sender_proto_addr(sender_ip);
    arp_packet.set_target_hw_addr(arp_target_hw);
    arp_packet.set_target_proto_addr(target_ip);

    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_without_target_mac_uses_broadcast() {
        let frame = build_arp_frame(
            ArpOperations::Request,
            MacAddr::new(1, 2, 3, 4, 5, 6),
            Ipv4Addr::new(10, 0, 0, 5),
            None,
            Ipv4Addr::new(10, 0, 0, 20),
        )
        .unwrap();
        assert_eq!(&frame[0..6], &[0xff; 6]);
    }

    #[test]
    fn reply_without_target_mac_fails() {
        let err = build_arp_frame(
            ArpOperations::Reply,
            MacAddr::new(1, 2, 3, 4, 5, 6),
            Ipv4Addr::new(10, 0, 0, 5),
            None,
            Ipv4Addr::new(10, 0, 0, 20),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidReply));
    }
}

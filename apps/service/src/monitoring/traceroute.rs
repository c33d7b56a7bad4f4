//! TTL-stepped ICMP traceroute over a raw IPv4 socket.
//!
//! Raw ICMP receive sockets see every ICMP message delivered to the host,
//! so replies are matched on the identifier and sequence of the echo request
//! we sent, either directly (echo reply) or inside the quoted datagram of a
//! time-exceeded / destination-unreachable message.

use pnet::packet::Packet;
use pnet::packet::icmp::destination_unreachable::DestinationUnreachablePacket;
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::{EchoRequestPacket, MutableEchoRequestPacket};
use pnet::packet::icmp::time_exceeded::TimeExceededPacket;
use pnet::packet::icmp::{self, IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::types::{Hop, HopReply, TracerouteResult};

const PROBE_PAYLOAD: &[u8] = b"ccc-traceroute";

#[derive(Debug, Clone)]
pub struct Tracer {
    max_hops: u8,
    hop_timeout: Duration,
    /// Set once the raw socket failure has been reported
    socket_warned: Arc<AtomicBool>,
}

impl Tracer {
    pub fn new(max_hops: u8, hop_timeout: Duration) -> Self {
        Self { max_hops: max_hops.max(1), hop_timeout, socket_warned: Arc::new(AtomicBool::new(false)) }
    }

    pub async fn trace(&self, destination: Ipv4Addr) -> TracerouteResult {
        let (max_hops, hop_timeout) = (self.max_hops, self.hop_timeout);
        let identifier: u16 = rand::random();
        let task = tokio::task::spawn_blocking(move || {
            trace_blocking(destination, max_hops, hop_timeout, identifier)
        });

        match task.await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                if !self.socket_warned.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        "Cannot open raw ICMP socket for traceroute, hop fallback is disabled \
                         (needs CAP_NET_RAW): {}",
                        e
                    );
                }
                TracerouteResult::failed(format!("raw socket error: {}", e))
            }
            Err(e) => TracerouteResult::failed(format!("traceroute task failed: {}", e)),
        }
    }
}

/// Fails only when the raw socket cannot be opened
fn trace_blocking(
    destination: Ipv4Addr,
    max_hops: u8,
    hop_timeout: Duration,
    identifier: u16,
) -> io::Result<TracerouteResult> {
    let mut socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    let target = SockAddr::from(SocketAddrV4::new(destination, 0));

    Ok(walk_path(max_hops, |ttl| {
        socket.set_ttl(u32::from(ttl))?;
        let sequence = u16::from(ttl);
        let packet = encode_echo_request(identifier, sequence, PROBE_PAYLOAD);

        let sent_at = Instant::now();
        match socket.send_to(&packet, &target) {
            Ok(_) => Ok(await_reply(&mut socket, identifier, sequence, ttl, sent_at, hop_timeout)),
            Err(e) => {
                tracing::debug!("Traceroute send to {} at ttl {} failed: {}", destination, ttl, e);
                Ok(Hop::silent(ttl))
            }
        }
    }))
}

/// Step TTLs until the destination answers or hops run out. A step that
/// errors ends the walk; the hops gathered before it are kept.
fn walk_path(max_hops: u8, mut probe: impl FnMut(u8) -> io::Result<Hop>) -> TracerouteResult {
    let mut result = TracerouteResult::default();

    for ttl in 1..=max_hops {
        let hop = match probe(ttl) {
            Ok(hop) => hop,
            Err(e) => {
                result.error = Some(format!("stopped at ttl {}: {}", ttl, e));
                break;
            }
        };

        let reached = hop.reply.is_some_and(HopReply::reaches_destination);
        if hop.address.is_some() {
            result.last_hop = Some(hop.clone());
        }
        result.hops.push(hop);

        if reached {
            result.reached_destination = true;
            break;
        }
    }

    result
}

fn await_reply(
    socket: &mut Socket,
    identifier: u16,
    sequence: u16,
    ttl: u8,
    sent_at: Instant,
    timeout: Duration,
) -> Hop {
    let deadline = sent_at + timeout;
    let mut buf = [0u8; 1500];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || socket.set_read_timeout(Some(remaining)).is_err() {
            return Hop::silent(ttl);
        }

        match socket.read(&mut buf) {
            Ok(len) => {
                if let Some((source, reply)) = parse_reply(&buf[..len], identifier, sequence) {
                    return Hop {
                        ttl,
                        address: Some(source),
                        rtt: Some(sent_at.elapsed()),
                        reply: Some(reply),
                    };
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return Hop::silent(ttl),
        }
    }
}

pub(crate) fn encode_echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; MutableEchoRequestPacket::minimum_packet_size() + payload.len()];
    if let Some(mut request) = MutableEchoRequestPacket::new(&mut buffer) {
        request.set_icmp_type(IcmpTypes::EchoRequest);
        request.set_identifier(identifier);
        request.set_sequence_number(sequence);
        request.set_payload(payload);
        if let Some(sum) = IcmpPacket::new(request.packet()).map(|packet| icmp::checksum(&packet)) {
            request.set_checksum(sum);
        }
    }
    buffer
}

/// Source address and payload of an IPv4 datagram. The header length field
/// is honoured; the total length is not, since quoted headers overstate it.
fn split_ipv4(datagram: &[u8]) -> Option<(Ipv4Addr, &[u8])> {
    let header = Ipv4Packet::new(datagram)?;
    let header_len = usize::from(header.get_header_length()) * 4;
    if header.get_version() != 4 || header_len < Ipv4Packet::minimum_packet_size() {
        return None;
    }
    Some((header.get_source(), datagram.get(header_len..)?))
}

/// Whether a quoted datagram is our echo request `(identifier, sequence)`
fn quotes_request(quoted: &[u8], identifier: u16, sequence: u16) -> Option<()> {
    let (_, inner) = split_ipv4(quoted)?;
    let request = EchoRequestPacket::new(inner)?;
    (request.get_icmp_type() == IcmpTypes::EchoRequest
        && request.get_identifier() == identifier
        && request.get_sequence_number() == sequence)
        .then_some(())
}

/// Match a received datagram against the echo request `(identifier, sequence)`
pub(crate) fn parse_reply(datagram: &[u8], identifier: u16, sequence: u16) -> Option<(Ipv4Addr, HopReply)> {
    let (source, body) = split_ipv4(datagram)?;
    let kind = IcmpPacket::new(body)?.get_icmp_type();

    let reply = if kind == IcmpTypes::EchoReply {
        let echo = EchoReplyPacket::new(body)?;
        if (echo.get_identifier(), echo.get_sequence_number()) != (identifier, sequence) {
            return None;
        }
        HopReply::EchoReply
    } else if kind == IcmpTypes::TimeExceeded {
        quotes_request(TimeExceededPacket::new(body)?.payload(), identifier, sequence)?;
        HopReply::TimeExceeded
    } else if kind == IcmpTypes::DestinationUnreachable {
        quotes_request(DestinationUnreachablePacket::new(body)?.payload(), identifier, sequence)?;
        HopReply::DestinationUnreachable
    } else {
        return None;
    };

    Some((source, reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ICMP_ECHO_REPLY: u8 = 0;
    const ICMP_DEST_UNREACHABLE: u8 = 3;
    const ICMP_TIME_EXCEEDED: u8 = 11;

    fn ipv4_header(source: Ipv4Addr, destination: Ipv4Addr) -> Vec<u8> {
        let mut header = vec![0x45, 0, 0, 0, 0, 0, 0, 0, 64, 1, 0, 0];
        header.extend_from_slice(&source.octets());
        header.extend_from_slice(&destination.octets());
        header
    }

    fn icmp_error(kind: u8, router: Ipv4Addr, quoted_request: &[u8]) -> Vec<u8> {
        let mut datagram = ipv4_header(router, Ipv4Addr::new(192, 0, 2, 10));
        datagram.extend_from_slice(&[kind, 0, 0, 0, 0, 0, 0, 0]);
        datagram.extend_from_slice(&ipv4_header(Ipv4Addr::new(192, 0, 2, 10), Ipv4Addr::new(8, 8, 8, 8)));
        datagram.extend_from_slice(&quoted_request[..8]);
        datagram
    }

    fn answered(ttl: u8, reply: HopReply) -> Hop {
        Hop {
            ttl,
            address: Some(Ipv4Addr::new(198, 51, 100, ttl)),
            rtt: Some(Duration::from_millis(3)),
            reply: Some(reply),
        }
    }

    #[test]
    fn test_echo_request_encoding() {
        let packet = encode_echo_request(0x1234, 7, PROBE_PAYLOAD);
        let request = EchoRequestPacket::new(&packet).unwrap();
        assert_eq!(request.get_icmp_type(), IcmpTypes::EchoRequest);
        assert_eq!((request.get_identifier(), request.get_sequence_number()), (0x1234, 7));
        assert_eq!(request.payload(), PROBE_PAYLOAD);

        let stored = u16::from_be_bytes([packet[2], packet[3]]);
        assert_ne!(stored, 0);
        assert_eq!(icmp::checksum(&IcmpPacket::new(&packet).unwrap()), stored);
    }

    #[test]
    fn test_parse_time_exceeded_matches_quoted_request() {
        let router = Ipv4Addr::new(10, 20, 0, 1);
        let request = encode_echo_request(42, 3, PROBE_PAYLOAD);
        let datagram = icmp_error(ICMP_TIME_EXCEEDED, router, &request);

        assert_eq!(parse_reply(&datagram, 42, 3), Some((router, HopReply::TimeExceeded)));
        // Stale reply for an earlier TTL
        assert_eq!(parse_reply(&datagram, 42, 2), None);
        // Someone else's traceroute
        assert_eq!(parse_reply(&datagram, 43, 3), None);
    }

    #[test]
    fn test_parse_unreachable_ends_trace() {
        let router = Ipv4Addr::new(203, 0, 113, 9);
        let request = encode_echo_request(9, 12, PROBE_PAYLOAD);
        let datagram = icmp_error(ICMP_DEST_UNREACHABLE, router, &request);

        let (source, reply) = parse_reply(&datagram, 9, 12).unwrap();
        assert_eq!(source, router);
        assert!(reply.reaches_destination());
    }

    #[test]
    fn test_parse_echo_reply() {
        let destination = Ipv4Addr::new(8, 8, 8, 8);
        let mut datagram = ipv4_header(destination, Ipv4Addr::new(192, 0, 2, 10));
        let mut reply = encode_echo_request(5, 1, b"");
        reply[0] = ICMP_ECHO_REPLY;
        datagram.extend_from_slice(&reply);

        assert_eq!(parse_reply(&datagram, 5, 1), Some((destination, HopReply::EchoReply)));
        assert_eq!(parse_reply(&datagram, 5, 2), None);
    }

    #[test]
    fn test_parse_rejects_truncated_and_foreign_packets() {
        assert_eq!(parse_reply(&[], 1, 1), None);
        assert_eq!(parse_reply(&[0x45, 0, 0], 1, 1), None);

        let mut own_request = ipv4_header(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST);
        own_request.extend_from_slice(&encode_echo_request(1, 1, b""));
        assert_eq!(parse_reply(&own_request, 1, 1), None);

        // Header length below the 20 byte minimum
        let mut short_header = ipv4_header(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST);
        short_header[0] = 0x44;
        short_header.extend_from_slice(&encode_echo_request(1, 1, b""));
        assert_eq!(parse_reply(&short_header, 1, 1), None);
    }

    #[test]
    fn test_walk_stops_at_destination() {
        let result = walk_path(30, |ttl| {
            Ok(match ttl {
                2 => Hop::silent(ttl),
                4 => answered(ttl, HopReply::EchoReply),
                _ => answered(ttl, HopReply::TimeExceeded),
            })
        });

        assert_eq!(result.hops.len(), 4);
        assert!(result.reached_destination);
        assert!(result.error.is_none());
        assert_eq!(result.last_hop.map(|hop| hop.ttl), Some(4));
    }

    #[test]
    fn test_walk_keeps_hops_gathered_before_a_failure() {
        let result = walk_path(30, |ttl| {
            if ttl == 4 {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "setsockopt"))
            } else {
                Ok(answered(ttl, HopReply::TimeExceeded))
            }
        });

        assert_eq!(result.hops.len(), 3);
        assert!(!result.reached_destination);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("ttl 4")));
        assert_eq!(result.last_hop.and_then(|hop| hop.address), Some(Ipv4Addr::new(198, 51, 100, 3)));
    }
}

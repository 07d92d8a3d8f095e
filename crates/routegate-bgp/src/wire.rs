//! BGP-4 wire encoding (RFC 4271), limited to what the speaker sends
//! and the little it must understand from peers.
//!
//! Everything here is a pure function over byte buffers; the session
//! layer owns all I/O. Outgoing UPDATEs always carry 4-octet AS_PATH
//! segments, matching the four-octet-AS capability the OPEN offers.

use std::net::Ipv4Addr;

use thiserror::Error;

pub const BGP_VERSION: u8 = 4;
pub const BGP_PORT: u16 = 179;
pub const HOLD_TIME_SECS: u16 = 90;
/// Placeholder 2-octet ASN when the real ASN needs four octets.
pub const AS_TRANS: u16 = 23456;

const MARKER_LEN: usize = 16;
pub const HEADER_LEN: usize = 19;
const MAX_MESSAGE_LEN: usize = 4096;

const TYPE_OPEN: u8 = 1;
const TYPE_UPDATE: u8 = 2;
const TYPE_NOTIFICATION: u8 = 3;
const TYPE_KEEPALIVE: u8 = 4;

const ATTR_ORIGIN: u8 = 1;
const ATTR_AS_PATH: u8 = 2;
const ATTR_NEXT_HOP: u8 = 3;
const FLAG_TRANSITIVE: u8 = 0x40;

const ORIGIN_IGP: u8 = 0;
const AS_SEQUENCE: u8 = 2;

const CAP_MP_EXTENSIONS: u8 = 1;
const CAP_FOUR_OCTET_AS: u8 = 65;
const OPT_PARAM_CAPABILITIES: u8 = 2;

/// Malformed frame from a peer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("bad marker in message header")]
    BadMarker,

    #[error("message length {0} outside {HEADER_LEN}..={MAX_MESSAGE_LEN}")]
    BadLength(u16),

    #[error("unknown message type {0}")]
    BadType(u8),

    #[error("message body truncated")]
    Truncated,
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Body length, header excluded.
    pub body_len: usize,
    pub msg_type: u8,
}

/// The subset of peer messages the session layer reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Open(PeerOpen),
    /// Received UPDATE; routes are not processed, only the size is kept
    /// for logging.
    Update { body_len: usize },
    Notification { code: u8, subcode: u8 },
    Keepalive,
}

/// Fields of a peer's OPEN the session cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerOpen {
    pub version: u8,
    pub asn: u16,
    pub hold_time: u16,
    pub router_id: Ipv4Addr,
}

/// One IPv4 unicast path: the only thing this speaker originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathSpec {
    pub prefix: Ipv4Addr,
    pub prefix_len: u8,
    pub next_hop: Ipv4Addr,
}

impl std::fmt::Display for PathSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} via {}", self.prefix, self.prefix_len, self.next_hop)
    }
}

/// Parameters of the local OPEN.
#[derive(Debug, Clone, Copy)]
pub struct OpenParams {
    pub asn: u32,
    pub hold_time: u16,
    pub router_id: Ipv4Addr,
}

fn finish(msg_type: u8, body: Vec<u8>) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_LEN + body.len());
    msg.extend_from_slice(&[0xff; MARKER_LEN]);
    msg.extend_from_slice(&((HEADER_LEN + body.len()) as u16).to_be_bytes());
    msg.push(msg_type);
    msg.extend_from_slice(&body);
    msg
}

/// Encode an OPEN advertising IPv4-unicast and four-octet-AS support.
pub fn encode_open(params: &OpenParams) -> Vec<u8> {
    let short_asn: u16 = u16::try_from(params.asn).unwrap_or(AS_TRANS);

    let mut caps = Vec::new();
    // Multiprotocol: AFI 1 (IPv4), SAFI 1 (unicast).
    caps.extend_from_slice(&[CAP_MP_EXTENSIONS, 4, 0x00, 0x01, 0x00, 0x01]);
    caps.extend_from_slice(&[CAP_FOUR_OCTET_AS, 4]);
    caps.extend_from_slice(&params.asn.to_be_bytes());

    let mut body = Vec::new();
    body.push(BGP_VERSION);
    body.extend_from_slice(&short_asn.to_be_bytes());
    body.extend_from_slice(&params.hold_time.to_be_bytes());
    body.extend_from_slice(&params.router_id.octets());
    body.push((caps.len() + 2) as u8); // optional parameters length
    body.push(OPT_PARAM_CAPABILITIES);
    body.push(caps.len() as u8);
    body.extend_from_slice(&caps);

    finish(TYPE_OPEN, body)
}

/// Encode a KEEPALIVE (header only).
pub fn encode_keepalive() -> Vec<u8> {
    finish(TYPE_KEEPALIVE, Vec::new())
}

fn nlri_bytes(prefix: Ipv4Addr, prefix_len: u8) -> Vec<u8> {
    let octets = prefix.octets();
    let mut nlri = vec![prefix_len];
    nlri.extend_from_slice(&octets[..prefix_len.div_ceil(8) as usize]);
    nlri
}

/// Encode an UPDATE advertising `path`.
///
/// Attributes: ORIGIN=IGP, AS_PATH (empty towards iBGP peers, one
/// 4-octet AS_SEQUENCE hop towards eBGP peers), NEXT_HOP.
pub fn encode_update_advertise(path: &PathSpec, local_asn: u32, peer_asn: u32) -> Vec<u8> {
    let mut attrs = Vec::new();

    attrs.extend_from_slice(&[FLAG_TRANSITIVE, ATTR_ORIGIN, 1, ORIGIN_IGP]);

    if local_asn == peer_asn {
        attrs.extend_from_slice(&[FLAG_TRANSITIVE, ATTR_AS_PATH, 0]);
    } else {
        attrs.extend_from_slice(&[FLAG_TRANSITIVE, ATTR_AS_PATH, 6, AS_SEQUENCE, 1]);
        attrs.extend_from_slice(&local_asn.to_be_bytes());
    }

    attrs.extend_from_slice(&[FLAG_TRANSITIVE, ATTR_NEXT_HOP, 4]);
    attrs.extend_from_slice(&path.next_hop.octets());

    let mut body = Vec::new();
    body.extend_from_slice(&0u16.to_be_bytes()); // withdrawn routes length
    body.extend_from_slice(&(attrs.len() as u16).to_be_bytes());
    body.extend_from_slice(&attrs);
    body.extend_from_slice(&nlri_bytes(path.prefix, path.prefix_len));

    finish(TYPE_UPDATE, body)
}

/// Encode an UPDATE withdrawing `path`.
pub fn encode_update_withdraw(path: &PathSpec) -> Vec<u8> {
    let nlri = nlri_bytes(path.prefix, path.prefix_len);

    let mut body = Vec::new();
    body.extend_from_slice(&(nlri.len() as u16).to_be_bytes());
    body.extend_from_slice(&nlri);
    body.extend_from_slice(&0u16.to_be_bytes()); // no path attributes

    finish(TYPE_UPDATE, body)
}

/// Decode and validate a message header.
pub fn decode_header(buf: &[u8; HEADER_LEN]) -> Result<Header, WireError> {
    if buf[..MARKER_LEN].iter().any(|&b| b != 0xff) {
        return Err(WireError::BadMarker);
    }
    let length = u16::from_be_bytes([buf[16], buf[17]]);
    if (length as usize) < HEADER_LEN || (length as usize) > MAX_MESSAGE_LEN {
        return Err(WireError::BadLength(length));
    }
    let msg_type = buf[18];
    if !(TYPE_OPEN..=TYPE_KEEPALIVE).contains(&msg_type) {
        return Err(WireError::BadType(msg_type));
    }
    Ok(Header {
        body_len: length as usize - HEADER_LEN,
        msg_type,
    })
}

/// Decode a message body against its header.
pub fn decode_message(header: Header, body: &[u8]) -> Result<Message, WireError> {
    if body.len() != header.body_len {
        return Err(WireError::Truncated);
    }
    match header.msg_type {
        TYPE_OPEN => {
            if body.len() < 10 {
                return Err(WireError::Truncated);
            }
            Ok(Message::Open(PeerOpen {
                version: body[0],
                asn: u16::from_be_bytes([body[1], body[2]]),
                hold_time: u16::from_be_bytes([body[3], body[4]]),
                router_id: Ipv4Addr::new(body[5], body[6], body[7], body[8]),
            }))
        }
        TYPE_UPDATE => Ok(Message::Update {
            body_len: body.len(),
        }),
        TYPE_NOTIFICATION => {
            if body.len() < 2 {
                return Err(WireError::Truncated);
            }
            Ok(Message::Notification {
                code: body[0],
                subcode: body[1],
            })
        }
        TYPE_KEEPALIVE => Ok(Message::Keepalive),
        other => Err(WireError::BadType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> PathSpec {
        PathSpec {
            prefix: Ipv4Addr::new(10, 88, 2, 1),
            prefix_len: 32,
            next_hop: Ipv4Addr::new(10, 88, 0, 200),
        }
    }

    #[test]
    fn keepalive_is_bare_header() {
        let msg = encode_keepalive();
        assert_eq!(msg.len(), 19);
        assert_eq!(&msg[..16], &[0xff; 16]);
        assert_eq!(&msg[16..], &[0, 19, 4]);
    }

    #[test]
    fn open_layout() {
        let msg = encode_open(&OpenParams {
            asn: 65512,
            hold_time: 90,
            router_id: Ipv4Addr::new(10, 88, 0, 200),
        });

        assert_eq!(msg[18], 1); // OPEN
        let body = &msg[19..];
        assert_eq!(body[0], 4); // version
        assert_eq!(&body[1..3], &65512u16.to_be_bytes()); // fits two octets
        assert_eq!(&body[3..5], &[0, 90]); // hold time
        assert_eq!(&body[5..9], &[10, 88, 0, 200]); // router id
        assert_eq!(body[9], 14); // optional parameters length
        // Capabilities parameter wrapping MP IPv4-unicast + 4-octet AS.
        assert_eq!(&body[10..12], &[2, 12]);
        assert_eq!(&body[12..18], &[1, 4, 0, 1, 0, 1]);
        assert_eq!(&body[18..20], &[65, 4]);
        assert_eq!(&body[20..24], &65512u32.to_be_bytes());
        // Declared length matches.
        assert_eq!(u16::from_be_bytes([msg[16], msg[17]]) as usize, msg.len());
    }

    #[test]
    fn open_wide_asn_uses_as_trans() {
        let msg = encode_open(&OpenParams {
            asn: 4_200_000_001,
            hold_time: 90,
            router_id: Ipv4Addr::new(192, 0, 2, 1),
        });
        let body = &msg[19..];
        assert_eq!(&body[1..3], &AS_TRANS.to_be_bytes());
        assert_eq!(&body[20..24], &4_200_000_001u32.to_be_bytes());
    }

    #[test]
    fn advertise_ibgp_layout() {
        let msg = encode_update_advertise(&path(), 65512, 65512);

        assert_eq!(msg[18], 2); // UPDATE
        let body = &msg[19..];
        assert_eq!(&body[0..2], &[0, 0]); // no withdrawn routes
        let attr_len = u16::from_be_bytes([body[2], body[3]]) as usize;
        let attrs = &body[4..4 + attr_len];
        assert_eq!(&attrs[0..4], &[0x40, 1, 1, 0]); // ORIGIN=IGP
        assert_eq!(&attrs[4..7], &[0x40, 2, 0]); // empty AS_PATH
        assert_eq!(&attrs[7..10], &[0x40, 3, 4]); // NEXT_HOP
        assert_eq!(&attrs[10..14], &[10, 88, 0, 200]);
        // NLRI for 10.88.2.1/32.
        assert_eq!(&body[4 + attr_len..], &[32, 10, 88, 2, 1]);
    }

    #[test]
    fn advertise_ebgp_prepends_local_asn() {
        let msg = encode_update_advertise(&path(), 65512, 64900);
        let body = &msg[19..];
        let attr_len = u16::from_be_bytes([body[2], body[3]]) as usize;
        let attrs = &body[4..4 + attr_len];

        assert_eq!(&attrs[4..9], &[0x40, 2, 6, 2, 1]); // AS_SEQUENCE, 1 hop
        assert_eq!(&attrs[9..13], &65512u32.to_be_bytes());
    }

    #[test]
    fn withdraw_layout() {
        let msg = encode_update_withdraw(&path());
        let body = &msg[19..];

        assert_eq!(&body[0..2], &[0, 5]); // withdrawn routes length
        assert_eq!(&body[2..7], &[32, 10, 88, 2, 1]);
        assert_eq!(&body[7..9], &[0, 0]); // no attributes
    }

    #[test]
    fn short_prefix_truncates_nlri() {
        let msg = encode_update_withdraw(&PathSpec {
            prefix: Ipv4Addr::new(10, 88, 0, 0),
            prefix_len: 16,
            next_hop: Ipv4Addr::new(10, 88, 0, 200),
        });
        let body = &msg[19..];
        assert_eq!(&body[0..2], &[0, 3]);
        assert_eq!(&body[2..5], &[16, 10, 88]);
    }

    #[test]
    fn header_roundtrip() {
        let msg = encode_open(&OpenParams {
            asn: 65512,
            hold_time: 90,
            router_id: Ipv4Addr::new(10, 88, 0, 200),
        });
        let header = decode_header(msg[..19].try_into().unwrap()).unwrap();
        assert_eq!(header.msg_type, 1);
        assert_eq!(header.body_len, msg.len() - 19);

        let decoded = decode_message(header, &msg[19..]).unwrap();
        assert_eq!(
            decoded,
            Message::Open(PeerOpen {
                version: 4,
                asn: 65512,
                hold_time: 90,
                router_id: Ipv4Addr::new(10, 88, 0, 200),
            })
        );
    }

    #[test]
    fn header_rejects_bad_marker() {
        let mut buf = [0xffu8; 19];
        buf[0] = 0;
        buf[17] = 19;
        buf[18] = 4;
        assert!(matches!(decode_header(&buf), Err(WireError::BadMarker)));
    }

    #[test]
    fn header_rejects_short_length() {
        let mut buf = [0xffu8; 19];
        buf[16] = 0;
        buf[17] = 18;
        buf[18] = 4;
        assert!(matches!(decode_header(&buf), Err(WireError::BadLength(18))));
    }

    #[test]
    fn header_rejects_unknown_type() {
        let mut buf = [0xffu8; 19];
        buf[16] = 0;
        buf[17] = 19;
        buf[18] = 9;
        assert!(matches!(decode_header(&buf), Err(WireError::BadType(9))));
    }

    #[test]
    fn notification_decodes_codes() {
        let header = Header {
            body_len: 2,
            msg_type: 3,
        };
        let decoded = decode_message(header, &[6, 4]).unwrap();
        assert_eq!(
            decoded,
            Message::Notification {
                code: 6,
                subcode: 4
            }
        );
    }
}

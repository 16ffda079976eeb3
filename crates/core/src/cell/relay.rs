use super::codec::CellError;
use onionpath_common::{protocol, RouterDescriptor, RouterIdentity, FINGERPRINT_LEN};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Handshake type carried in CREATE2/EXTEND2: X25519 exchange keyed through KDF-TOR
pub const HTYPE_X25519: u16 = 0x0000;

/// Reason codes carried by DESTROY and TRUNCATED
pub mod destroy_reason {
    pub const NONE: u8 = 0;
    pub const PROTOCOL: u8 = 1;
    pub const INTERNAL: u8 = 2;
    pub const REQUESTED: u8 = 3;
    pub const HIBERNATING: u8 = 4;
    pub const RESOURCELIMIT: u8 = 5;
    pub const CONNECTFAILED: u8 = 6;
    pub const OR_IDENTITY: u8 = 7;
    pub const CHANNEL_CLOSED: u8 = 8;
    pub const FINISHED: u8 = 9;
    pub const TIMEOUT: u8 = 10;
    pub const DESTROYED: u8 = 11;
    pub const NOSUCHSERVICE: u8 = 12;
}

/// Reason codes carried by RELAY_END
pub mod end_reason {
    pub const MISC: u8 = 1;
    pub const RESOLVEFAILED: u8 = 2;
    pub const CONNECTREFUSED: u8 = 3;
    pub const EXITPOLICY: u8 = 4;
    pub const DESTROY: u8 = 5;
    pub const DONE: u8 = 6;
    pub const TIMEOUT: u8 = 7;
    pub const NOROUTE: u8 = 8;
    pub const HIBERNATING: u8 = 9;
    pub const INTERNAL: u8 = 10;
    pub const RESOURCELIMIT: u8 = 11;
    pub const CONNRESET: u8 = 12;
    pub const TORPROTOCOL: u8 = 13;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayCommand {
    Begin,
    Data,
    End,
    Connected,
    Sendme,
    Extend,
    Extended,
    Truncate,
    Truncated,
    Drop,
    Resolve,
    Resolved,
    BeginDir,
    Extend2,
    Extended2,
    EstablishIntro,
    EstablishRendezvous,
    Introduce1,
    Introduce2,
    Rendezvous1,
    Rendezvous2,
    IntroEstablished,
    RendezvousEstablished,
    IntroduceAck,
    Other(u8),
}

impl RelayCommand {
    pub fn from_u8(cmd: u8) -> Self {
        match cmd {
            1 => Self::Begin,
            2 => Self::Data,
            3 => Self::End,
            4 => Self::Connected,
            5 => Self::Sendme,
            6 => Self::Extend,
            7 => Self::Extended,
            8 => Self::Truncate,
            9 => Self::Truncated,
            10 => Self::Drop,
            11 => Self::Resolve,
            12 => Self::Resolved,
            13 => Self::BeginDir,
            14 => Self::Extend2,
            15 => Self::Extended2,
            32 => Self::EstablishIntro,
            33 => Self::EstablishRendezvous,
            34 => Self::Introduce1,
            35 => Self::Introduce2,
            36 => Self::Rendezvous1,
            37 => Self::Rendezvous2,
            38 => Self::IntroEstablished,
            39 => Self::RendezvousEstablished,
            40 => Self::IntroduceAck,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Begin => 1,
            Self::Data => 2,
            Self::End => 3,
            Self::Connected => 4,
            Self::Sendme => 5,
            Self::Extend => 6,
            Self::Extended => 7,
            Self::Truncate => 8,
            Self::Truncated => 9,
            Self::Drop => 10,
            Self::Resolve => 11,
            Self::Resolved => 12,
            Self::BeginDir => 13,
            Self::Extend2 => 14,
            Self::Extended2 => 15,
            Self::EstablishIntro => 32,
            Self::EstablishRendezvous => 33,
            Self::Introduce1 => 34,
            Self::Introduce2 => 35,
            Self::Rendezvous1 => 36,
            Self::Rendezvous2 => 37,
            Self::IntroEstablished => 38,
            Self::RendezvousEstablished => 39,
            Self::IntroduceAck => 40,
            Self::Other(cmd) => *cmd,
        }
    }
}

impl std::fmt::Display for RelayCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other(cmd) => write!(f, "RELAY_UNKNOWN({})", cmd),
            known => write!(f, "RELAY_{:?}", known),
        }
    }
}

/// Plaintext relay cell as seen by its origin or destination hop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    pub command: RelayCommand,
    pub stream_id: u16,
    pub data: Vec<u8>,
}

impl RelayCell {
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        Self {
            command,
            stream_id,
            data,
        }
    }

    /// Circuit-level control cell (stream id 0)
    pub fn control(command: RelayCommand, data: Vec<u8>) -> Self {
        Self::new(command, 0, data)
    }

    /// Serialize with `recognized` and digest zeroed; the digest is filled in
    /// by the hop crypto when the cell is sealed.
    pub fn encode(&self) -> Result<[u8; protocol::CELL_PAYLOAD_LEN], CellError> {
        if self.data.len() > protocol::RELAY_DATA_LEN {
            return Err(CellError::PayloadTooLarge(self.data.len()));
        }
        let mut out = [0u8; protocol::CELL_PAYLOAD_LEN];
        out[0] = self.command.as_u8();
        out[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        out[9..11].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        out[protocol::RELAY_HEADER_LEN..protocol::RELAY_HEADER_LEN + self.data.len()]
            .copy_from_slice(&self.data);
        Ok(out)
    }

    pub fn decode(payload: &[u8; protocol::CELL_PAYLOAD_LEN]) -> Result<Self, CellError> {
        let command = RelayCommand::from_u8(payload[0]);
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let length = u16::from_be_bytes([payload[9], payload[10]]) as usize;
        if length > protocol::RELAY_DATA_LEN {
            return Err(CellError::malformed(
                "relay cell",
                format!("length {} exceeds {}", length, protocol::RELAY_DATA_LEN),
            ));
        }
        let data =
            payload[protocol::RELAY_HEADER_LEN..protocol::RELAY_HEADER_LEN + length].to_vec();
        Ok(Self {
            command,
            stream_id,
            data,
        })
    }

    /// First data byte, used by END and TRUNCATED
    pub fn reason(&self) -> u8 {
        self.data.first().copied().unwrap_or(end_reason::MISC)
    }
}

/// `host:port` BEGIN body with zero flags
pub fn begin_body(target: &str, port: u16) -> Vec<u8> {
    let mut body = format!("{}:{}", target, port).into_bytes();
    body.push(0);
    body.extend_from_slice(&0u32.to_be_bytes());
    body
}

/// Split a BEGIN body into target and port
pub fn parse_begin(data: &[u8]) -> Result<(String, u16), CellError> {
    let end = data
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| CellError::malformed("BEGIN", "missing terminator"))?;
    let text = std::str::from_utf8(&data[..end])
        .map_err(|e| CellError::malformed("BEGIN", e.to_string()))?;
    let (host, port) = text
        .rsplit_once(':')
        .ok_or_else(|| CellError::malformed("BEGIN", "missing port"))?;
    let port = port
        .parse()
        .map_err(|_| CellError::malformed("BEGIN", format!("bad port {:?}", port)))?;
    Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

/// Link specifiers naming the next hop in EXTEND2
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpecifier {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    LegacyId(RouterIdentity),
    Unrecognized(u8, Vec<u8>),
}

impl LinkSpecifier {
    pub fn for_router(router: &RouterDescriptor) -> Vec<LinkSpecifier> {
        let addr = match router.address {
            IpAddr::V4(v4) => LinkSpecifier::Ipv4(v4, router.or_port),
            IpAddr::V6(v6) => LinkSpecifier::Ipv6(v6, router.or_port),
        };
        vec![addr, LinkSpecifier::LegacyId(router.identity)]
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Ipv4(addr, port) => {
                out.push(0);
                out.push(6);
                out.extend_from_slice(&addr.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            Self::Ipv6(addr, port) => {
                out.push(1);
                out.push(18);
                out.extend_from_slice(&addr.octets());
                out.extend_from_slice(&port.to_be_bytes());
            }
            Self::LegacyId(id) => {
                out.push(2);
                out.push(FINGERPRINT_LEN as u8);
                out.extend_from_slice(id.as_bytes());
            }
            Self::Unrecognized(kind, body) => {
                out.push(*kind);
                out.push(body.len() as u8);
                out.extend_from_slice(body);
            }
        }
    }

    fn decode(kind: u8, body: &[u8]) -> Result<Self, CellError> {
        let bad = || CellError::malformed("link specifier", format!("type {} length {}", kind, body.len()));
        match kind {
            0 => {
                if body.len() != 6 {
                    return Err(bad());
                }
                let addr = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                Ok(Self::Ipv4(addr, u16::from_be_bytes([body[4], body[5]])))
            }
            1 => {
                if body.len() != 18 {
                    return Err(bad());
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                Ok(Self::Ipv6(
                    Ipv6Addr::from(octets),
                    u16::from_be_bytes([body[16], body[17]]),
                ))
            }
            2 => RouterIdentity::from_slice(body)
                .map(Self::LegacyId)
                .map_err(|_| bad()),
            other => Ok(Self::Unrecognized(other, body.to_vec())),
        }
    }
}

/// Body of CREATE2 and the handshake part of EXTEND2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub htype: u16,
    pub hdata: Vec<u8>,
}

impl HandshakeRequest {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.htype.to_be_bytes());
        out.extend_from_slice(&(self.hdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.hdata);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.hdata.len());
        self.encode_into(&mut out);
        out
    }

    /// Parse from the front of `data`, returning the unread remainder
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), CellError> {
        if data.len() < 4 {
            return Err(CellError::malformed("handshake request", "short header"));
        }
        let htype = u16::from_be_bytes([data[0], data[1]]);
        let hlen = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < 4 + hlen {
            return Err(CellError::malformed(
                "handshake request",
                format!("hlen {} exceeds body", hlen),
            ));
        }
        Ok((
            Self {
                htype,
                hdata: data[4..4 + hlen].to_vec(),
            },
            &data[4 + hlen..],
        ))
    }
}

/// `HLEN | HDATA` body of CREATED2 and EXTENDED2
pub fn handshake_reply_body(hdata: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + hdata.len());
    out.extend_from_slice(&(hdata.len() as u16).to_be_bytes());
    out.extend_from_slice(hdata);
    out
}

pub fn parse_handshake_reply(data: &[u8]) -> Result<Vec<u8>, CellError> {
    if data.len() < 2 {
        return Err(CellError::malformed("handshake reply", "short header"));
    }
    let hlen = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + hlen {
        return Err(CellError::malformed(
            "handshake reply",
            format!("hlen {} exceeds body", hlen),
        ));
    }
    Ok(data[2..2 + hlen].to_vec())
}

/// EXTEND2 body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extend2 {
    pub link_specifiers: Vec<LinkSpecifier>,
    pub handshake: HandshakeRequest,
}

impl Extend2 {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.link_specifiers.len() as u8);
        for spec in &self.link_specifiers {
            spec.encode_into(&mut out);
        }
        self.handshake.encode_into(&mut out);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CellError> {
        let (&count, mut rest) = data
            .split_first()
            .ok_or_else(|| CellError::malformed("EXTEND2", "empty body"))?;
        let mut link_specifiers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if rest.len() < 2 {
                return Err(CellError::malformed("EXTEND2", "short link specifier"));
            }
            let kind = rest[0];
            let len = rest[1] as usize;
            if rest.len() < 2 + len {
                return Err(CellError::malformed("EXTEND2", "link specifier overruns body"));
            }
            link_specifiers.push(LinkSpecifier::decode(kind, &rest[2..2 + len])?);
            rest = &rest[2 + len..];
        }
        let (handshake, _) = HandshakeRequest::decode(rest)?;
        Ok(Self {
            link_specifiers,
            handshake,
        })
    }

    pub fn legacy_id(&self) -> Option<RouterIdentity> {
        self.link_specifiers.iter().find_map(|spec| match spec {
            LinkSpecifier::LegacyId(id) => Some(*id),
            _ => None,
        })
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.link_specifiers.iter().find_map(|spec| match spec {
            LinkSpecifier::Ipv4(addr, port) => Some(SocketAddr::new(IpAddr::V4(*addr), *port)),
            LinkSpecifier::Ipv6(addr, port) => Some(SocketAddr::new(IpAddr::V6(*addr), *port)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_header_layout() {
        let cell = RelayCell::new(RelayCommand::Data, 0x0102, vec![0xAA; 3]);
        let payload = cell.encode().unwrap();
        assert_eq!(payload[0], 2);
        assert_eq!(&payload[1..3], &[0, 0]);
        assert_eq!(&payload[3..5], &[1, 2]);
        assert_eq!(&payload[5..9], &[0, 0, 0, 0]);
        assert_eq!(&payload[9..11], &[0, 3]);
        assert_eq!(&payload[11..14], &[0xAA; 3]);

        assert_eq!(RelayCell::decode(&payload).unwrap(), cell);
    }

    #[test]
    fn test_relay_data_limit() {
        let cell = RelayCell::new(RelayCommand::Data, 1, vec![0; protocol::RELAY_DATA_LEN + 1]);
        assert!(cell.encode().is_err());

        let mut payload = [0u8; protocol::CELL_PAYLOAD_LEN];
        payload[9..11].copy_from_slice(&600u16.to_be_bytes());
        assert!(RelayCell::decode(&payload).is_err());
    }

    #[test]
    fn test_begin_body() {
        let body = begin_body("example.com", 443);
        assert_eq!(&body[..16], b"example.com:443\0");
        assert_eq!(parse_begin(&body).unwrap(), ("example.com".to_string(), 443));
        assert!(parse_begin(b"no-terminator").is_err());
    }

    #[test]
    fn test_extend2_names_router() {
        let id = RouterIdentity::from_bytes([0x42; 20]);
        let router = RouterDescriptor::new(id, "mid", "198.51.100.9:9001".parse().unwrap());
        let extend = Extend2 {
            link_specifiers: LinkSpecifier::for_router(&router),
            handshake: HandshakeRequest {
                htype: HTYPE_X25519,
                hdata: vec![7; 32],
            },
        };
        let body = extend.encode();
        assert_eq!(body[0], 2);
        assert_eq!(&body[1..3], &[0, 6]);

        let parsed = Extend2::decode(&body).unwrap();
        assert_eq!(parsed.legacy_id(), Some(id));
        assert_eq!(parsed.address(), Some(router.socket_addr()));
        assert_eq!(parsed.handshake.hdata, vec![7; 32]);
    }

    #[test]
    fn test_handshake_reply_body() {
        let body = handshake_reply_body(&[1, 2, 3]);
        assert_eq!(body, vec![0, 3, 1, 2, 3]);
        assert_eq!(parse_handshake_reply(&body).unwrap(), vec![1, 2, 3]);
        assert!(parse_handshake_reply(&[0, 9, 1]).is_err());
    }
}

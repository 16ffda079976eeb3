use onionpath_common::{protocol, OnionError, Timestamp};
use std::net::IpAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum CellError {
    #[error("cell truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("payload of {0} bytes does not fit a fixed-length cell")]
    PayloadTooLarge(usize),

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CellError {
    pub fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            detail: detail.into(),
        }
    }
}

impl From<CellError> for OnionError {
    fn from(err: CellError) -> Self {
        match err {
            CellError::Io(io) => OnionError::Transport(io.to_string()),
            other => OnionError::Protocol(other.to_string()),
        }
    }
}

/// Link-level cell commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellCommand {
    Padding,
    Create,
    Created,
    Relay,
    Destroy,
    CreateFast,
    CreatedFast,
    Versions,
    Netinfo,
    RelayEarly,
    Create2,
    Created2,
    PaddingNegotiate,
    VPadding,
    Certs,
    AuthChallenge,
    Authenticate,
    /// Command byte this implementation does not know
    Other(u8),
}

impl CellCommand {
    pub fn from_u8(cmd: u8) -> Self {
        match cmd {
            0 => Self::Padding,
            1 => Self::Create,
            2 => Self::Created,
            3 => Self::Relay,
            4 => Self::Destroy,
            5 => Self::CreateFast,
            6 => Self::CreatedFast,
            7 => Self::Versions,
            8 => Self::Netinfo,
            9 => Self::RelayEarly,
            10 => Self::Create2,
            11 => Self::Created2,
            12 => Self::PaddingNegotiate,
            128 => Self::VPadding,
            129 => Self::Certs,
            130 => Self::AuthChallenge,
            131 => Self::Authenticate,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            Self::Padding => 0,
            Self::Create => 1,
            Self::Created => 2,
            Self::Relay => 3,
            Self::Destroy => 4,
            Self::CreateFast => 5,
            Self::CreatedFast => 6,
            Self::Versions => 7,
            Self::Netinfo => 8,
            Self::RelayEarly => 9,
            Self::Create2 => 10,
            Self::Created2 => 11,
            Self::PaddingNegotiate => 12,
            Self::VPadding => 128,
            Self::Certs => 129,
            Self::AuthChallenge => 130,
            Self::Authenticate => 131,
            Self::Other(cmd) => *cmd,
        }
    }

    /// VERSIONS and every command >= 128 use the variable-length framing
    pub fn is_variable_length(&self) -> bool {
        let cmd = self.as_u8();
        cmd == 7 || cmd >= 128
    }

    pub fn is_padding(&self) -> bool {
        matches!(self, Self::Padding | Self::VPadding)
    }

    pub fn is_relay(&self) -> bool {
        matches!(self, Self::Relay | Self::RelayEarly)
    }
}

impl std::fmt::Display for CellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other(cmd) => write!(f, "UNKNOWN({})", cmd),
            known => write!(f, "{:?}", known),
        }
    }
}

/// A link-level cell.
///
/// Fixed-length cells always carry a 509-byte payload; shorter payloads
/// are zero-padded on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub circ_id: u32,
    pub command: CellCommand,
    pub payload: Vec<u8>,
}

impl Cell {
    pub fn new(circ_id: u32, command: CellCommand, payload: Vec<u8>) -> Result<Self, CellError> {
        if command.is_variable_length() {
            if payload.len() > u16::MAX as usize {
                return Err(CellError::PayloadTooLarge(payload.len()));
            }
            return Ok(Self {
                circ_id,
                command,
                payload,
            });
        }

        if payload.len() > protocol::CELL_PAYLOAD_LEN {
            return Err(CellError::PayloadTooLarge(payload.len()));
        }
        let mut payload = payload;
        payload.resize(protocol::CELL_PAYLOAD_LEN, 0);
        Ok(Self {
            circ_id,
            command,
            payload,
        })
    }

    /// Build a fixed-length cell from a full relay payload
    pub fn relay(circ_id: u32, payload: [u8; protocol::CELL_PAYLOAD_LEN], early: bool) -> Self {
        Self {
            circ_id,
            command: if early {
                CellCommand::RelayEarly
            } else {
                CellCommand::Relay
            },
            payload: payload.to_vec(),
        }
    }

    pub fn destroy(circ_id: u32, reason: u8) -> Self {
        let mut payload = vec![0u8; protocol::CELL_PAYLOAD_LEN];
        payload[0] = reason;
        Self {
            circ_id,
            command: CellCommand::Destroy,
            payload,
        }
    }

    /// NETINFO naming the peer's address and none of ours
    pub fn netinfo(peer: IpAddr) -> Self {
        let mut payload = Vec::with_capacity(protocol::CELL_PAYLOAD_LEN);
        payload.extend_from_slice(&(Timestamp::now().as_secs() as u32).to_be_bytes());
        match peer {
            IpAddr::V4(v4) => {
                payload.extend_from_slice(&[4, 4]);
                payload.extend_from_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                payload.extend_from_slice(&[6, 16]);
                payload.extend_from_slice(&v6.octets());
            }
        }
        payload.push(0);
        payload.resize(protocol::CELL_PAYLOAD_LEN, 0);
        Self {
            circ_id: 0,
            command: CellCommand::Netinfo,
            payload,
        }
    }

    pub fn padding() -> Self {
        Self {
            circ_id: 0,
            command: CellCommand::Padding,
            payload: vec![0u8; protocol::CELL_PAYLOAD_LEN],
        }
    }

    /// First payload byte, used by DESTROY and TRUNCATED
    pub fn reason(&self) -> u8 {
        self.payload.first().copied().unwrap_or(0)
    }

    /// Relay payload as a fixed array
    pub fn relay_payload(&self) -> Result<[u8; protocol::CELL_PAYLOAD_LEN], CellError> {
        if self.payload.len() != protocol::CELL_PAYLOAD_LEN {
            return Err(CellError::malformed(
                "relay cell",
                format!("payload is {} bytes", self.payload.len()),
            ));
        }
        let mut out = [0u8; protocol::CELL_PAYLOAD_LEN];
        out.copy_from_slice(&self.payload);
        Ok(out)
    }

    /// Serialize into link protocol v4 framing
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(protocol::CELL_LEN);
        buf.extend_from_slice(&self.circ_id.to_be_bytes());
        buf.push(self.command.as_u8());
        if self.command.is_variable_length() {
            buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
            buf.extend_from_slice(&self.payload);
        } else {
            buf.extend_from_slice(&self.payload);
            buf.resize(protocol::CELL_LEN, 0);
        }
        buf
    }

    /// Parse one cell from the front of `data`, returning it with the bytes consumed
    pub fn decode(data: &[u8]) -> Result<(Self, usize), CellError> {
        let header = protocol::CIRC_ID_LEN + 1;
        if data.len() < header {
            return Err(CellError::Truncated {
                needed: header,
                available: data.len(),
            });
        }

        let circ_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let command = CellCommand::from_u8(data[4]);

        if command.is_variable_length() {
            if data.len() < header + 2 {
                return Err(CellError::Truncated {
                    needed: header + 2,
                    available: data.len(),
                });
            }
            let len = u16::from_be_bytes([data[5], data[6]]) as usize;
            let total = header + 2 + len;
            if data.len() < total {
                return Err(CellError::Truncated {
                    needed: total,
                    available: data.len(),
                });
            }
            let payload = data[header + 2..total].to_vec();
            return Ok((
                Self {
                    circ_id,
                    command,
                    payload,
                },
                total,
            ));
        }

        if data.len() < protocol::CELL_LEN {
            return Err(CellError::Truncated {
                needed: protocol::CELL_LEN,
                available: data.len(),
            });
        }
        let payload = data[header..protocol::CELL_LEN].to_vec();
        Ok((
            Self {
                circ_id,
                command,
                payload,
            },
            protocol::CELL_LEN,
        ))
    }
}

/// Read one cell; `Ok(None)` on a clean end of stream between cells
pub async fn read_cell<R>(reader: &mut R) -> Result<Option<Cell>, CellError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; protocol::CIRC_ID_LEN + 1];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let circ_id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let command = CellCommand::from_u8(header[4]);

    let payload = if command.is_variable_length() {
        let mut len = [0u8; 2];
        reader.read_exact(&mut len).await?;
        let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
        reader.read_exact(&mut payload).await?;
        payload
    } else {
        let mut payload = vec![0u8; protocol::CELL_PAYLOAD_LEN];
        reader.read_exact(&mut payload).await?;
        payload
    };

    Ok(Some(Cell {
        circ_id,
        command,
        payload,
    }))
}

pub async fn write_cell<W>(writer: &mut W, cell: &Cell) -> Result<(), CellError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&cell.encode()).await?;
    Ok(())
}

/// VERSIONS is sent before the link version is known and always uses a
/// two-byte circuit id.
pub async fn write_versions<W>(writer: &mut W, versions: &[u16]) -> Result<(), CellError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(5 + 2 * versions.len());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.push(CellCommand::Versions.as_u8());
    buf.extend_from_slice(&((2 * versions.len()) as u16).to_be_bytes());
    for version in versions {
        buf.extend_from_slice(&version.to_be_bytes());
    }
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_versions<R>(reader: &mut R) -> Result<Vec<u16>, CellError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).await?;
    if CellCommand::from_u8(header[2]) != CellCommand::Versions {
        return Err(CellError::malformed(
            "VERSIONS",
            format!("got command {}", header[2]),
        ));
    }
    let len = u16::from_be_bytes([header[3], header[4]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

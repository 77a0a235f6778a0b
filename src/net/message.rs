//! Wire frame and message classes (§6.2): `u8 protocol_version | u8
//! message_class | payload`, read and written directly against an async
//! stream — the block layout already fixes exact byte offsets, so (as with
//! `block::codec`) a generic serde format would under-specify this and is
//! deliberately not used here.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::block::BLOCK_SIZE;
use crate::config::{HASH_SIZE, MAX_HASH_COUNT, PEER_ID_SIZE, PROTOCOL_VERSION};
use crate::error::{ProtocolError, ProtocolErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    Hello,
    HashRequest,
    HashResponse,
    BlockRequest,
    BlockResponse,
    BlockSend,
    NodeRequest,
    NodeResponse,
    NodeBroadcast,
}

impl MessageClass {
    pub const ALL: [MessageClass; 9] = [
        MessageClass::Hello,
        MessageClass::HashRequest,
        MessageClass::HashResponse,
        MessageClass::BlockRequest,
        MessageClass::BlockResponse,
        MessageClass::BlockSend,
        MessageClass::NodeRequest,
        MessageClass::NodeResponse,
        MessageClass::NodeBroadcast,
    ];

    /// Node* classes are assigned `0x06..=0x08`, kept clear of Block* at
    /// `0x03..=0x05`.
    pub fn code(self) -> u8 {
        match self {
            MessageClass::Hello => 0x00,
            MessageClass::HashRequest => 0x01,
            MessageClass::HashResponse => 0x02,
            MessageClass::BlockRequest => 0x03,
            MessageClass::BlockResponse => 0x04,
            MessageClass::BlockSend => 0x05,
            MessageClass::NodeRequest => 0x06,
            MessageClass::NodeResponse => 0x07,
            MessageClass::NodeBroadcast => 0x08,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello { peer_id: [u8; PEER_ID_SIZE] },
    HashRequest,
    HashResponse { hashes: Vec<[u8; HASH_SIZE]> },
    BlockRequest { hashes: Vec<[u8; HASH_SIZE]> },
    BlockResponse { blocks: Vec<[u8; BLOCK_SIZE]> },
    BlockSend { blocks: Vec<[u8; BLOCK_SIZE]> },
    NodeRequest,
    NodeResponse { addrs: Vec<String> },
    NodeBroadcast { addrs: Vec<String> },
}

impl Message {
    pub fn class(&self) -> MessageClass {
        match self {
            Message::Hello { .. } => MessageClass::Hello,
            Message::HashRequest => MessageClass::HashRequest,
            Message::HashResponse { .. } => MessageClass::HashResponse,
            Message::BlockRequest { .. } => MessageClass::BlockRequest,
            Message::BlockResponse { .. } => MessageClass::BlockResponse,
            Message::BlockSend { .. } => MessageClass::BlockSend,
            Message::NodeRequest => MessageClass::NodeRequest,
            Message::NodeResponse { .. } => MessageClass::NodeResponse,
            Message::NodeBroadcast { .. } => MessageClass::NodeBroadcast,
        }
    }

    /// Serialized payload length, header excluded — used by `stats.rs`.
    pub fn payload_len(&self) -> usize {
        match self {
            Message::Hello { .. } => PEER_ID_SIZE,
            Message::HashRequest | Message::NodeRequest => 0,
            Message::HashResponse { hashes } | Message::BlockRequest { hashes } => {
                4 + hashes.len() * HASH_SIZE
            }
            Message::BlockResponse { blocks } | Message::BlockSend { blocks } => {
                4 + blocks.len() * BLOCK_SIZE
            }
            Message::NodeResponse { addrs } | Message::NodeBroadcast { addrs } => {
                4 + addrs.iter().map(|a| 2 + a.len()).sum::<usize>()
            }
        }
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_u8(PROTOCOL_VERSION).await?;
        w.write_u8(self.class().code()).await?;
        match self {
            Message::Hello { peer_id } => w.write_all(peer_id).await?,
            Message::HashRequest | Message::NodeRequest => {}
            Message::HashResponse { hashes } | Message::BlockRequest { hashes } => {
                w.write_u32(hashes.len() as u32).await?;
                for h in hashes {
                    w.write_all(h).await?;
                }
            }
            Message::BlockResponse { blocks } | Message::BlockSend { blocks } => {
                w.write_u32(blocks.len() as u32).await?;
                for b in blocks {
                    w.write_all(b).await?;
                }
            }
            Message::NodeResponse { addrs } | Message::NodeBroadcast { addrs } => {
                w.write_u32(addrs.len() as u32).await?;
                for addr in addrs {
                    w.write_u16(addr.len() as u16).await?;
                    w.write_all(addr.as_bytes()).await?;
                }
            }
        }
        w.flush().await
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Message, ProtocolError> {
        let version = read_u8(r).await?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::new(ProtocolErrorKind::ShortFrame));
        }
        let class_byte = read_u8(r).await?;
        let class = MessageClass::from_code(class_byte)
            .ok_or_else(|| ProtocolError::new(ProtocolErrorKind::UnknownMessageClass))?;

        Ok(match class {
            MessageClass::Hello => {
                let mut peer_id = [0u8; PEER_ID_SIZE];
                read_exact(r, &mut peer_id).await?;
                Message::Hello { peer_id }
            }
            MessageClass::HashRequest => Message::HashRequest,
            MessageClass::NodeRequest => Message::NodeRequest,
            MessageClass::HashResponse | MessageClass::BlockRequest => {
                let hashes = read_hashes(r).await?;
                if class == MessageClass::HashResponse {
                    Message::HashResponse { hashes }
                } else {
                    Message::BlockRequest { hashes }
                }
            }
            MessageClass::BlockResponse | MessageClass::BlockSend => {
                let blocks = read_blocks(r).await?;
                if class == MessageClass::BlockResponse {
                    Message::BlockResponse { blocks }
                } else {
                    Message::BlockSend { blocks }
                }
            }
            MessageClass::NodeResponse | MessageClass::NodeBroadcast => {
                let addrs = read_addrs(r).await?;
                if class == MessageClass::NodeResponse {
                    Message::NodeResponse { addrs }
                } else {
                    Message::NodeBroadcast { addrs }
                }
            }
        })
    }
}

async fn read_u8<R: AsyncRead + Unpin>(r: &mut R) -> Result<u8, ProtocolError> {
    r.read_u8().await.map_err(|_| ProtocolError::new(ProtocolErrorKind::ShortFrame))
}

async fn read_exact<R: AsyncRead + Unpin>(r: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    r.read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|_| ProtocolError::new(ProtocolErrorKind::ShortFrame))
}

async fn read_count<R: AsyncRead + Unpin>(r: &mut R) -> Result<usize, ProtocolError> {
    let count = r
        .read_u32()
        .await
        .map_err(|_| ProtocolError::new(ProtocolErrorKind::ShortFrame))? as usize;
    if count > MAX_HASH_COUNT {
        return Err(ProtocolError::new(ProtocolErrorKind::CountOverflow));
    }
    Ok(count)
}

async fn read_hashes<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<[u8; HASH_SIZE]>, ProtocolError> {
    let count = read_count(r).await?;
    let mut hashes = Vec::with_capacity(count);
    for _ in 0..count {
        let mut h = [0u8; HASH_SIZE];
        read_exact(r, &mut h).await?;
        hashes.push(h);
    }
    Ok(hashes)
}

async fn read_blocks<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<[u8; BLOCK_SIZE]>, ProtocolError> {
    let count = read_count(r).await?;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        let mut b = [0u8; BLOCK_SIZE];
        read_exact(r, &mut b).await?;
        blocks.push(b);
    }
    Ok(blocks)
}

async fn read_addrs<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<String>, ProtocolError> {
    let count = read_count(r).await?;
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let len = r
            .read_u16()
            .await
            .map_err(|_| ProtocolError::new(ProtocolErrorKind::ShortFrame))? as usize;
        let mut bytes = vec![0u8; len];
        read_exact(r, &mut bytes).await?;
        let addr = String::from_utf8(bytes).map_err(|_| ProtocolError::new(ProtocolErrorKind::ShortFrame))?;
        addrs.push(addr);
    }
    Ok(addrs)
}

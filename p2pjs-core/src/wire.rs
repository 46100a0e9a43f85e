//! Codec: fixed-layout binary messages (2-byte tag, host-native integers).
//!
//! Text fields (addresses, ports) are NUL-padded to a fixed width. Only the
//! PeerList count and the Job source length make a message variable-sized.

use crate::cookie::Cookie;
use crate::protocol::{
    JobKind, JobStatus, Layout, Message, MessageKind, PeerAddress, ADDRESS_FIELD_LEN,
    COOKIE_LEN, MAX_SOURCE_LEN, PEER_INFO_LEN, PORT_FIELD_LEN, TAG_LEN,
};

/// Encode a message into its wire bytes.
pub fn encode(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(encoded_len_hint(msg));
    out.extend_from_slice(&msg.kind().tag().to_ne_bytes());
    match msg {
        Message::Hello { port } => {
            put_port(&mut out, *port);
        }
        Message::GetPeers => {}
        Message::PeerList { peers } => {
            let count = u16::try_from(peers.len()).map_err(|_| EncodeError::TooManyPeers)?;
            out.extend_from_slice(&count.to_ne_bytes());
            for peer in peers {
                put_peer(&mut out, peer)?;
            }
        }
        Message::QueryJobResources {
            kind,
            cookie,
            origin,
        } => {
            out.extend_from_slice(&kind.to_wire().to_ne_bytes());
            out.extend_from_slice(cookie.as_bytes());
            put_peer(&mut out, origin)?;
        }
        Message::OfferJobResources { cookie } => {
            out.extend_from_slice(cookie.as_bytes());
        }
        Message::Job {
            cookie,
            arg,
            source,
        } => {
            let len = u32::try_from(source.len())
                .ok()
                .filter(|&l| l <= MAX_SOURCE_LEN)
                .ok_or(EncodeError::SourceTooLarge)?;
            out.extend_from_slice(&len.to_ne_bytes());
            out.extend_from_slice(cookie.as_bytes());
            out.extend_from_slice(&arg.to_ne_bytes());
            out.extend_from_slice(source.as_bytes());
        }
        Message::JobResult {
            cookie,
            status,
            result,
        } => {
            out.extend_from_slice(cookie.as_bytes());
            out.extend_from_slice(&status.to_wire().to_ne_bytes());
            out.extend_from_slice(&result.to_ne_bytes());
        }
    }
    Ok(out)
}

fn encoded_len_hint(msg: &Message) -> usize {
    match (msg.kind().layout(), msg) {
        (Layout::Fixed(n), _) => n,
        (_, Message::PeerList { peers }) => TAG_LEN + 2 + peers.len() * PEER_INFO_LEN,
        (_, Message::Job { source, .. }) => TAG_LEN + 4 + COOKIE_LEN + 8 + source.len(),
        _ => TAG_LEN,
    }
}

fn put_port(out: &mut Vec<u8>, port: u16) {
    let mut field = [0u8; PORT_FIELD_LEN];
    let text = port.to_string();
    field[..text.len()].copy_from_slice(text.as_bytes());
    out.extend_from_slice(&field);
}

fn put_peer(out: &mut Vec<u8>, peer: &PeerAddress) -> Result<(), EncodeError> {
    let bytes = peer.address.as_bytes();
    if bytes.is_empty() || bytes.len() >= ADDRESS_FIELD_LEN || bytes.contains(&0) {
        return Err(EncodeError::InvalidAddress(peer.address.clone()));
    }
    let mut field = [0u8; ADDRESS_FIELD_LEN];
    field[..bytes.len()].copy_from_slice(bytes);
    out.extend_from_slice(&field);
    put_port(out, peer.port);
    Ok(())
}

/// Error encoding a message (a field does not fit its wire width).
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("address {0:?} does not fit the address field")]
    InvalidAddress(String),
    #[error("peer list longer than {}", u16::MAX)]
    TooManyPeers,
    #[error("job source larger than {MAX_SOURCE_LEN} bytes")]
    SourceTooLarge,
}

/// Decode exactly one complete message. `bytes` must span the whole message, tag included.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let mut r = Reader::new(bytes);
    let tag = r.u16()?;
    let kind = MessageKind::from_tag(tag).ok_or(DecodeError::UnknownMessageType(tag))?;
    let expected = match kind.layout() {
        Layout::Fixed(n) => n,
        Layout::Prefixed(2) => kind
            .prefixed_len(u32::from(r.peek_u16()?))
            .ok_or(DecodeError::InvalidValue("length field out of range"))?,
        Layout::Prefixed(_) => kind
            .prefixed_len(r.peek_u32()?)
            .ok_or(DecodeError::InvalidValue("length field out of range"))?,
    };
    if bytes.len() != expected {
        return Err(DecodeError::InvalidValue("message length does not match its kind"));
    }

    let msg = match kind {
        MessageKind::Hello => Message::Hello { port: r.port()? },
        MessageKind::GetPeers => Message::GetPeers,
        MessageKind::PeerList => {
            let count = r.u16()?;
            let mut peers = Vec::with_capacity(count as usize);
            for _ in 0..count {
                peers.push(r.peer()?);
            }
            Message::PeerList { peers }
        }
        MessageKind::QueryJobResources => {
            let kind = JobKind::from_wire(r.u32()?)
                .ok_or(DecodeError::InvalidValue("unknown job kind"))?;
            let cookie = r.cookie()?;
            let origin = r.peer()?;
            Message::QueryJobResources {
                kind,
                cookie,
                origin,
            }
        }
        MessageKind::OfferJobResources => Message::OfferJobResources {
            cookie: r.cookie()?,
        },
        MessageKind::Job => {
            let len = r.u32()? as usize;
            let cookie = r.cookie()?;
            let arg = r.f64()?;
            let source = std::str::from_utf8(r.take(len)?)
                .map_err(|_| DecodeError::InvalidValue("job source is not UTF-8"))?
                .to_owned();
            Message::Job {
                cookie,
                arg,
                source,
            }
        }
        MessageKind::JobResult => {
            let cookie = r.cookie()?;
            let status = JobStatus::from_wire(r.u32()?)
                .ok_or(DecodeError::InvalidValue("unknown job status"))?;
            let result = r.f64()?;
            Message::JobResult {
                cookie,
                status,
                result,
            }
        }
    };
    Ok(msg)
}

/// Error decoding a message (unknown tag or malformed field).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown message type {0:#x}")]
    UnknownMessageType(u16),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        let end = end.ok_or(DecodeError::InvalidValue("message truncated"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_ne_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_ne_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_ne_bytes(self.array()?))
    }

    fn peek_u16(&self) -> Result<u16, DecodeError> {
        Reader::new(&self.buf[self.pos..]).u16()
    }

    fn peek_u32(&self) -> Result<u32, DecodeError> {
        Reader::new(&self.buf[self.pos..]).u32()
    }

    fn cookie(&mut self) -> Result<Cookie, DecodeError> {
        Ok(Cookie::from_bytes(self.array()?))
    }

    fn text(&mut self, width: usize) -> Result<&'a str, DecodeError> {
        let field = self.take(width)?;
        let end = field
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::InvalidValue("text field not NUL-terminated"))?;
        std::str::from_utf8(&field[..end]).map_err(|_| DecodeError::InvalidValue("text field is not UTF-8"))
    }

    fn port(&mut self) -> Result<u16, DecodeError> {
        self.text(PORT_FIELD_LEN)?
            .parse()
            .map_err(|_| DecodeError::InvalidValue("port is not a number"))
    }

    fn peer(&mut self) -> Result<PeerAddress, DecodeError> {
        let address = self.text(ADDRESS_FIELD_LEN)?;
        if address.is_empty() {
            return Err(DecodeError::InvalidValue("empty address"));
        }
        let address = address.to_owned();
        let port = self.port()?;
        Ok(PeerAddress { address, port })
    }
}

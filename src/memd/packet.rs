//! Packet framing for the binary KV protocol.
//!
//! Every packet starts with a 24-byte header followed by a body made of
//! framing extras, extras, key and value. The "alt" magics carry a one byte
//! framing extras length and a one byte key length in place of the classic
//! two byte key length.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::buffer::{read_slice, read_u8, read_u16, read_u32, read_u64, read_uleb128_u32, write_uleb128_u32};
use super::opcode::OpCode;
use super::status::Status;

/// Size of a packet header.
pub const HEADER_LEN: usize = 24;

/// Largest body accepted off the wire. Leaves room above the 20 MiB value
/// limit for key, extras and xattrs.
pub const MAX_BODY_LEN: u32 = 30 * 1024 * 1024;

/// Framing extra id for the server duration of a response.
const FRAME_SERVER_DURATION: u8 = 0x02;

/// Errors raised while framing or parsing packets.
#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid magic: 0x{0:02x}")]
    InvalidMagic(u8),

    #[error("Body length {0} exceeds limit")]
    BodyTooLarge(u32),

    #[error("Header lengths exceed body length")]
    InconsistentLengths,

    #[error("{field} too long for the header: {len}")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("Invalid LEB128 collection id")]
    InvalidLeb128,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Packet magic byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Magic {
    #[default]
    Req,
    Res,
    AltReq,
    AltRes,
}

impl Magic {
    pub fn from_byte(byte: u8) -> Result<Self, PacketError> {
        match byte {
            0x80 => Ok(Magic::Req),
            0x81 => Ok(Magic::Res),
            0x08 => Ok(Magic::AltReq),
            0x18 => Ok(Magic::AltRes),
            other => Err(PacketError::InvalidMagic(other)),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Magic::Req => 0x80,
            Magic::Res => 0x81,
            Magic::AltReq => 0x08,
            Magic::AltRes => 0x18,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(self, Magic::Req | Magic::AltReq)
    }

    pub fn is_alt(self) -> bool {
        matches!(self, Magic::AltReq | Magic::AltRes)
    }

    fn with_alt(self, alt: bool) -> Self {
        match (self.is_request(), alt) {
            (true, false) => Magic::Req,
            (true, true) => Magic::AltReq,
            (false, false) => Magic::Res,
            (false, true) => Magic::AltRes,
        }
    }
}

/// A decoded binary protocol packet.
///
/// `vbucket` is meaningful for requests, `status` for responses. The key
/// never includes the collection id prefix; that lives in `collection_id`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub magic: Magic,
    pub command: OpCode,
    pub datatype: u8,
    pub status: Status,
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    pub collection_id: u32,
    pub framing_extras: Vec<u8>,
    pub extras: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Packet {
    /// A request for `command`.
    pub fn request(command: OpCode) -> Self {
        Self {
            magic: Magic::Req,
            command,
            ..Default::default()
        }
    }

    /// A response echoing the command and opaque of `req`.
    pub fn response_to(req: &Packet, status: Status) -> Self {
        Self {
            magic: Magic::Res,
            command: req.command,
            opaque: req.opaque,
            status,
            ..Default::default()
        }
    }

    /// Body length of a packet whose header is `header`.
    pub fn body_len(header: &[u8]) -> Result<u32, PacketError> {
        read_u32(header, 8)
    }

    /// Parse a complete packet (header and body).
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let magic = Magic::from_byte(read_u8(buf, 0)?)?;
        let command = OpCode(read_u8(buf, 1)?);
        let (framing_len, key_len) = if magic.is_alt() {
            (usize::from(read_u8(buf, 2)?), usize::from(read_u8(buf, 3)?))
        } else {
            (0, usize::from(read_u16(buf, 2)?))
        };
        let extras_len = usize::from(read_u8(buf, 4)?);
        let datatype = read_u8(buf, 5)?;
        let vb_or_status = read_u16(buf, 6)?;
        let body_len = usize::try_from(read_u32(buf, 8)?).map_err(|_| PacketError::InconsistentLengths)?;
        let opaque = read_u32(buf, 12)?;
        let cas = read_u64(buf, 16)?;

        let fixed = framing_len + extras_len + key_len;
        if fixed > body_len {
            return Err(PacketError::InconsistentLengths);
        }
        let mut offset = HEADER_LEN;
        let framing_extras = read_slice(buf, offset, framing_len)?.to_vec();
        offset += framing_len;
        let extras = read_slice(buf, offset, extras_len)?.to_vec();
        offset += extras_len;
        let key = read_slice(buf, offset, key_len)?.to_vec();
        offset += key_len;
        let value = read_slice(buf, offset, body_len - fixed)?.to_vec();

        let (vbucket, status) = if magic.is_request() {
            (vb_or_status, Status::SUCCESS)
        } else {
            (0, Status(vb_or_status))
        };

        Ok(Self {
            magic,
            command,
            datatype,
            status,
            vbucket,
            opaque,
            cas,
            collection_id: 0,
            framing_extras,
            extras,
            key,
            value,
        })
    }

    /// Serialize the packet. The magic switches to its alt form whenever
    /// framing extras are present.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let alt = !self.framing_extras.is_empty();
        let magic = self.magic.with_alt(alt);

        let too_long = |field: &'static str, len: usize| PacketError::FieldTooLong { field, len };
        let extras_len = u8::try_from(self.extras.len()).map_err(|_| too_long("extras", self.extras.len()))?;
        let body_len = self.framing_extras.len() + self.extras.len() + self.key.len() + self.value.len();
        let body_len_u32 = u32::try_from(body_len).map_err(|_| too_long("body", body_len))?;

        let mut out = Vec::with_capacity(HEADER_LEN + body_len);
        out.push(magic.as_byte());
        out.push(self.command.0);
        if alt {
            out.push(
                u8::try_from(self.framing_extras.len())
                    .map_err(|_| too_long("framing extras", self.framing_extras.len()))?,
            );
            out.push(u8::try_from(self.key.len()).map_err(|_| too_long("key", self.key.len()))?);
        } else {
            let key_len = u16::try_from(self.key.len()).map_err(|_| too_long("key", self.key.len()))?;
            out.extend_from_slice(&key_len.to_be_bytes());
        }
        out.push(extras_len);
        out.push(self.datatype);
        let vb_or_status = if magic.is_request() { self.vbucket } else { self.status.0 };
        out.extend_from_slice(&vb_or_status.to_be_bytes());
        out.extend_from_slice(&body_len_u32.to_be_bytes());
        out.extend_from_slice(&self.opaque.to_be_bytes());
        out.extend_from_slice(&self.cas.to_be_bytes());
        out.extend_from_slice(&self.framing_extras);
        out.extend_from_slice(&self.extras);
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&self.value);
        Ok(out)
    }

    /// Move a LEB128 collection id prefix from the key into `collection_id`.
    pub fn take_collection_prefix(&mut self) -> Result<(), PacketError> {
        let (cid, used) = read_uleb128_u32(&self.key)?;
        self.collection_id = cid;
        self.key.drain(..used);
        Ok(())
    }

    /// Prepend `collection_id` to the key as a LEB128 prefix.
    pub fn add_collection_prefix(&mut self) {
        let mut key = Vec::with_capacity(self.key.len() + 5);
        write_uleb128_u32(&mut key, self.collection_id);
        key.extend_from_slice(&self.key);
        self.key = key;
    }

    /// Attach the server duration framing extra.
    pub fn set_server_duration(&mut self, elapsed: Duration) {
        let encoded = encode_server_duration(elapsed).to_be_bytes();
        self.framing_extras = vec![FRAME_SERVER_DURATION, encoded[0], encoded[1]];
    }

    /// Server duration carried in the framing extras, if any.
    pub fn server_duration(&self) -> Option<Duration> {
        let mut frames = self.framing_extras.as_slice();
        while let Some((&header, rest)) = frames.split_first() {
            let id = header >> 4;
            let len = usize::from(header & 0x0f);
            let data = rest.get(..len)?;
            if id == 0 && len == 2 {
                let encoded = u16::from_be_bytes([*data.first()?, *data.get(1)?]);
                return Some(decode_server_duration(encoded));
            }
            frames = rest.get(len..)?;
        }
        None
    }
}

/// Encode a duration as `(micros * 2) ^ (1 / 1.74)`, saturating at `u16::MAX`.
pub fn encode_server_duration(elapsed: Duration) -> u16 {
    let micros = elapsed.as_secs_f64() * 1_000_000.0;
    let encoded = (micros * 2.0).powf(1.0 / 1.74).round();
    if encoded >= f64::from(u16::MAX) {
        u16::MAX
    } else if encoded <= 0.0 {
        0
    } else {
        // Bounds checked above
        encoded as u16
    }
}

/// Inverse of [`encode_server_duration`].
pub fn decode_server_duration(encoded: u16) -> Duration {
    let micros = f64::from(encoded).powf(1.74) / 2.0;
    Duration::from_secs_f64(micros / 1_000_000.0)
}

/// Read one packet from a stream. Returns `Ok(None)` on a clean EOF before
/// the first header byte.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>, PacketError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let [magic, ..] = header;
    Magic::from_byte(magic)?;

    let body_len = Packet::body_len(&header)?;
    if body_len > MAX_BODY_LEN {
        return Err(PacketError::BodyTooLarge(body_len));
    }
    let mut frame = vec![0u8; HEADER_LEN + body_len as usize];
    frame
        .get_mut(..HEADER_LEN)
        .ok_or(PacketError::InconsistentLengths)?
        .copy_from_slice(&header);
    reader
        .read_exact(frame.get_mut(HEADER_LEN..).ok_or(PacketError::InconsistentLengths)?)
        .await?;
    Packet::decode(&frame).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_request() {
        let mut pak = Packet::request(OpCode::SET);
        pak.vbucket = 12;
        pak.opaque = 0xdeadbeef;
        pak.cas = 42;
        pak.extras = vec![0, 0, 0, 1, 0, 0, 0, 0];
        pak.key = b"key".to_vec();
        pak.value = b"{\"a\":1}".to_vec();
        pak.datatype = 1;

        let bytes = pak.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 8 + 3 + 7);
        assert_eq!(bytes[0], 0x80);
        assert_eq!(Packet::decode(&bytes).unwrap(), pak);
    }

    #[test]
    fn responses_carry_status_not_vbucket() {
        let req = Packet {
            opaque: 7,
            ..Packet::request(OpCode::GET)
        };
        let res = Packet::response_to(&req, Status::KEY_NOT_FOUND);
        let bytes = res.encode().unwrap();
        assert_eq!(&bytes[6..8], &[0x00, 0x01]);

        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.status, Status::KEY_NOT_FOUND);
        assert_eq!(decoded.opaque, 7);
        assert_eq!(decoded.magic, Magic::Res);
    }

    #[test]
    fn framing_extras_switch_to_alt_magic() {
        let mut res = Packet::response_to(&Packet::request(OpCode::GET), Status::SUCCESS);
        res.key = b"k".to_vec();
        res.set_server_duration(Duration::from_micros(500));

        let bytes = res.encode().unwrap();
        assert_eq!(bytes[0], 0x18);
        assert_eq!(bytes[2], 3);
        assert_eq!(bytes[3], 1);

        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.magic, Magic::AltRes);
        let duration = decoded.server_duration().unwrap();
        // The encoding is lossy; stay within a few percent
        let micros = duration.as_micros();
        assert!((480..=520).contains(&micros), "got {micros}");
    }

    #[test]
    fn duration_encoding_saturates() {
        assert_eq!(encode_server_duration(Duration::from_secs(3600)), u16::MAX);
        assert_eq!(encode_server_duration(Duration::ZERO), 0);
    }

    #[test]
    fn collection_prefix_roundtrip() {
        let mut pak = Packet::request(OpCode::GET);
        pak.key = b"doc".to_vec();
        pak.collection_id = 200;
        pak.add_collection_prefix();
        assert_eq!(pak.key, vec![0xc8, 0x01, b'd', b'o', b'c']);

        pak.collection_id = 0;
        pak.take_collection_prefix().unwrap();
        assert_eq!(pak.collection_id, 200);
        assert_eq!(pak.key, b"doc");
    }

    #[test]
    fn truncated_and_inconsistent_input() {
        assert!(matches!(Packet::decode(&[0x80; 10]), Err(PacketError::Truncated { .. })));
        assert!(matches!(Packet::decode(&[0x42; 24]), Err(PacketError::InvalidMagic(0x42))));

        let mut bytes = Packet::request(OpCode::GET).encode().unwrap();
        bytes[3] = 5; // key length beyond the empty body
        assert!(matches!(Packet::decode(&bytes), Err(PacketError::InconsistentLengths)));
    }

    #[tokio::test]
    async fn read_packet_from_stream() {
        let mut pak = Packet::request(OpCode::NOOP);
        pak.opaque = 99;
        let mut bytes = pak.encode().unwrap();
        bytes.extend(pak.encode().unwrap());

        let mut reader = bytes.as_slice();
        assert_eq!(read_packet(&mut reader).await.unwrap(), Some(pak.clone()));
        assert_eq!(read_packet(&mut reader).await.unwrap(), Some(pak));
        assert_eq!(read_packet(&mut reader).await.unwrap(), None);
    }
}

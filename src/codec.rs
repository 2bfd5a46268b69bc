//! Typed wire frame encode/decode: `type_byte || body`.
//!
//! Byte order is fixed as big-endian for every multi-byte field (the
//! underlying transport library's own framing is untyped bytes; this is
//! the core's own choice, documented here and stable across client/server
//! builds — spec §6's "Packet catalogue").

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

use crate::config::{MAX_ENCODED_BYTES, MAX_STRING_LENGTH};
use crate::config::ProtocolVersion;
use crate::error::FramingError;

/// Packet type tag. Values are part of the wire contract: requests first,
/// then responses, then events, then the encrypted wrapper. Never reorder
/// existing variants; only append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    InfoRequest = 0,
    LoginRequest = 1,
    LogoutRequest = 2,
    SetMute = 3,
    SetDeafen = 4,
    SetName = 5,
    SetTitle = 6,
    SetDescription = 7,
    SetEntityVisibility = 8,
    Audio = 9,
    AdvancedAudio = 10,
    InfoResponse = 11,
    AcceptResponse = 12,
    DenyResponse = 13,
    EntityCreated = 14,
    EntityDestroyed = 15,
    EncryptedEnvelope = 16,
    Heartbeat = 17,
}

impl PacketType {
    fn from_byte(b: u8) -> Result<Self, FramingError> {
        use PacketType::*;
        Ok(match b {
            0 => InfoRequest,
            1 => LoginRequest,
            2 => LogoutRequest,
            3 => SetMute,
            4 => SetDeafen,
            5 => SetName,
            6 => SetTitle,
            7 => SetDescription,
            8 => SetEntityVisibility,
            9 => Audio,
            10 => AdvancedAudio,
            11 => InfoResponse,
            12 => AcceptResponse,
            13 => DenyResponse,
            14 => EntityCreated,
            15 => EntityDestroyed,
            16 => EncryptedEnvelope,
            17 => Heartbeat,
            other => return Err(FramingError::UnknownType(other)),
        })
    }
}

/// `AdvancedAudio.flags` bits (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFlags(u8);

impl AudioFlags {
    pub const HAS_POSITION: AudioFlags = AudioFlags(0b0000_0001);
    pub const HAS_ROTATION: AudioFlags = AudioFlags(0b0000_0010);
    pub const NONE: AudioFlags = AudioFlags(0);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits_truncate(bits: u8) -> Self {
        AudioFlags(bits & (Self::HAS_POSITION.0 | Self::HAS_ROTATION.0))
    }

    pub fn contains(self, other: AudioFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AudioFlags {
    type Output = AudioFlags;
    fn bitor(self, rhs: AudioFlags) -> AudioFlags {
        AudioFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdvancedAudioBody {
    pub entity_id: i32,
    pub timestamp: u16,
    pub loudness: f32,
    pub flags: AudioFlags,
    pub position: Option<[f32; 3]>,
    pub rotation: Option<[f32; 2]>,
    pub opus_payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioBody {
    pub entity_id: i32,
    pub opus_payload: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedEnvelopeBody {
    pub iv: [u8; 12],
    pub tag: [u8; 16],
    pub ciphertext: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginRequestBody {
    pub request_id: u128,
    pub version: ProtocolVersion,
    pub user_id: String,
    pub public_key: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoRequestBody {
    pub request_id: u128,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcceptResponseBody {
    pub request_id: u128,
    pub entity_id: i32,
    pub server_public_key: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DenyResponseBody {
    pub request_id: u128,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InfoResponseBody {
    pub request_id: u128,
    pub motd: String,
    pub version: ProtocolVersion,
    pub connected_clients: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetEntityVisibilityBody {
    pub entity_id: i32,
    pub visible: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityCreatedBody {
    pub entity_id: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityDestroyedBody {
    pub entity_id: i32,
}

/// A single decoded/encoded wire packet.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    InfoRequest(InfoRequestBody),
    LoginRequest(LoginRequestBody),
    LogoutRequest,
    SetMute(bool),
    SetDeafen(bool),
    SetName(String),
    SetTitle(String),
    SetDescription(String),
    SetEntityVisibility(SetEntityVisibilityBody),
    Audio(AudioBody),
    AdvancedAudio(AdvancedAudioBody),
    InfoResponse(InfoResponseBody),
    AcceptResponse(AcceptResponseBody),
    DenyResponse(DenyResponseBody),
    EntityCreated(EntityCreatedBody),
    EntityDestroyed(EntityDestroyedBody),
    EncryptedEnvelope(EncryptedEnvelopeBody),
    /// Keepalive sent on the client's heartbeat interval; carries no body.
    Heartbeat,
}

fn put_string(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= MAX_STRING_LENGTH);
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(cur: &mut Cursor<&[u8]>) -> Result<String, FramingError> {
    let len = cur.read_u16::<BigEndian>().map_err(|_| FramingError::MalformedFrame)? as usize;
    if len > MAX_STRING_LENGTH {
        return Err(FramingError::OversizedPayload { len, max: MAX_STRING_LENGTH });
    }
    if cur.remaining() < len {
        return Err(FramingError::MalformedFrame);
    }
    let mut bytes = vec![0u8; len];
    cur.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| FramingError::MalformedFrame)
}

fn put_bytes_field(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u16(b.len() as u16);
    buf.put_slice(b);
}

fn get_bytes_field(cur: &mut Cursor<&[u8]>, max: usize) -> Result<Bytes, FramingError> {
    let len = cur.read_u16::<BigEndian>().map_err(|_| FramingError::MalformedFrame)? as usize;
    if len > max {
        return Err(FramingError::OversizedPayload { len, max });
    }
    if cur.remaining() < len {
        return Err(FramingError::MalformedFrame);
    }
    let mut bytes = vec![0u8; len];
    cur.copy_to_slice(&mut bytes);
    Ok(Bytes::from(bytes))
}

fn get_u128(cur: &mut Cursor<&[u8]>) -> Result<u128, FramingError> {
    cur.read_u128::<BigEndian>().map_err(|_| FramingError::MalformedFrame)
}

fn put_version(buf: &mut BytesMut, v: &ProtocolVersion) {
    buf.put_u16(v.major);
    buf.put_u16(v.minor);
    buf.put_u16(v.build);
}

fn get_version(cur: &mut Cursor<&[u8]>) -> Result<ProtocolVersion, FramingError> {
    Ok(ProtocolVersion {
        major: cur.read_u16::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
        minor: cur.read_u16::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
        build: cur.read_u16::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
    })
}

impl Packet {
    fn packet_type(&self) -> PacketType {
        match self {
            Packet::InfoRequest(_) => PacketType::InfoRequest,
            Packet::LoginRequest(_) => PacketType::LoginRequest,
            Packet::LogoutRequest => PacketType::LogoutRequest,
            Packet::SetMute(_) => PacketType::SetMute,
            Packet::SetDeafen(_) => PacketType::SetDeafen,
            Packet::SetName(_) => PacketType::SetName,
            Packet::SetTitle(_) => PacketType::SetTitle,
            Packet::SetDescription(_) => PacketType::SetDescription,
            Packet::SetEntityVisibility(_) => PacketType::SetEntityVisibility,
            Packet::Audio(_) => PacketType::Audio,
            Packet::AdvancedAudio(_) => PacketType::AdvancedAudio,
            Packet::InfoResponse(_) => PacketType::InfoResponse,
            Packet::AcceptResponse(_) => PacketType::AcceptResponse,
            Packet::DenyResponse(_) => PacketType::DenyResponse,
            Packet::EntityCreated(_) => PacketType::EntityCreated,
            Packet::EntityDestroyed(_) => PacketType::EntityDestroyed,
            Packet::EncryptedEnvelope(_) => PacketType::EncryptedEnvelope,
            Packet::Heartbeat => PacketType::Heartbeat,
        }
    }

    /// Encode `type_byte || body` into a fresh buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.packet_type() as u8);
        match self {
            Packet::LogoutRequest | Packet::Heartbeat => {}
            Packet::InfoRequest(b) => buf.put_u128(b.request_id),
            Packet::LoginRequest(b) => {
                buf.put_u128(b.request_id);
                put_version(&mut buf, &b.version);
                put_string(&mut buf, &b.user_id);
                put_bytes_field(&mut buf, &b.public_key);
            }
            Packet::SetMute(v) | Packet::SetDeafen(v) => buf.put_u8(*v as u8),
            Packet::SetName(s) | Packet::SetTitle(s) | Packet::SetDescription(s) => {
                put_string(&mut buf, s)
            }
            Packet::SetEntityVisibility(b) => {
                buf.put_i32(b.entity_id);
                buf.put_u8(b.visible as u8);
            }
            Packet::Audio(b) => {
                buf.put_i32(b.entity_id);
                put_bytes_field(&mut buf, &b.opus_payload);
            }
            Packet::AdvancedAudio(b) => {
                buf.put_i32(b.entity_id);
                buf.put_u16(b.timestamp);
                buf.put_f32(b.loudness);
                buf.put_u8(b.flags.bits());
                if b.flags.contains(AudioFlags::HAS_POSITION) {
                    let p = b.position.expect("HAS_POSITION flag set without position");
                    for c in p {
                        buf.put_f32(c);
                    }
                }
                if b.flags.contains(AudioFlags::HAS_ROTATION) {
                    let r = b.rotation.expect("HAS_ROTATION flag set without rotation");
                    for c in r {
                        buf.put_f32(c);
                    }
                }
                put_bytes_field(&mut buf, &b.opus_payload);
            }
            Packet::InfoResponse(b) => {
                buf.put_u128(b.request_id);
                put_string(&mut buf, &b.motd);
                put_version(&mut buf, &b.version);
                buf.put_u32(b.connected_clients);
            }
            Packet::AcceptResponse(b) => {
                buf.put_u128(b.request_id);
                buf.put_i32(b.entity_id);
                put_bytes_field(&mut buf, &b.server_public_key);
            }
            Packet::DenyResponse(b) => {
                buf.put_u128(b.request_id);
                put_string(&mut buf, &b.reason);
            }
            Packet::EntityCreated(b) => {
                buf.put_i32(b.entity_id);
                put_string(&mut buf, &b.name);
            }
            Packet::EntityDestroyed(b) => buf.put_i32(b.entity_id),
            Packet::EncryptedEnvelope(b) => {
                buf.put_slice(&b.iv);
                buf.put_slice(&b.tag);
                put_bytes_field(&mut buf, &b.ciphertext);
            }
        }
        buf.freeze()
    }

    /// Decode `type_byte || body`. Validates encoded-audio payloads never
    /// exceed [`MAX_ENCODED_BYTES`] (spec §4.2).
    pub fn decode(raw: &[u8]) -> Result<Self, FramingError> {
        if raw.is_empty() {
            return Err(FramingError::MalformedFrame);
        }
        let ty = PacketType::from_byte(raw[0])?;
        let mut cur = Cursor::new(&raw[1..]);
        let packet = match ty {
            PacketType::InfoRequest => Packet::InfoRequest(InfoRequestBody { request_id: get_u128(&mut cur)? }),
            PacketType::LogoutRequest => Packet::LogoutRequest,
            PacketType::Heartbeat => Packet::Heartbeat,
            PacketType::LoginRequest => Packet::LoginRequest(LoginRequestBody {
                request_id: get_u128(&mut cur)?,
                version: get_version(&mut cur)?,
                user_id: get_string(&mut cur)?,
                public_key: get_bytes_field(&mut cur, 128)?,
            }),
            PacketType::SetMute => Packet::SetMute(read_bool(&mut cur)?),
            PacketType::SetDeafen => Packet::SetDeafen(read_bool(&mut cur)?),
            PacketType::SetName => Packet::SetName(get_string(&mut cur)?),
            PacketType::SetTitle => Packet::SetTitle(get_string(&mut cur)?),
            PacketType::SetDescription => Packet::SetDescription(get_string(&mut cur)?),
            PacketType::SetEntityVisibility => Packet::SetEntityVisibility(SetEntityVisibilityBody {
                entity_id: cur.read_i32::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
                visible: read_bool(&mut cur)?,
            }),
            PacketType::Audio => Packet::Audio(AudioBody {
                entity_id: cur.read_i32::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
                opus_payload: get_bytes_field(&mut cur, MAX_ENCODED_BYTES)?,
            }),
            PacketType::AdvancedAudio => {
                let entity_id = cur.read_i32::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?;
                let timestamp = cur.read_u16::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?;
                let loudness = cur.read_f32::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?;
                let flags = AudioFlags::from_bits_truncate(
                    cur.read_u8().map_err(|_| FramingError::MalformedFrame)?,
                );
                let position = if flags.contains(AudioFlags::HAS_POSITION) {
                    Some([
                        cur.read_f32::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
                        cur.read_f32::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
                        cur.read_f32::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
                    ])
                } else {
                    None
                };
                let rotation = if flags.contains(AudioFlags::HAS_ROTATION) {
                    Some([
                        cur.read_f32::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
                        cur.read_f32::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
                    ])
                } else {
                    None
                };
                let opus_payload = get_bytes_field(&mut cur, MAX_ENCODED_BYTES)?;
                Packet::AdvancedAudio(AdvancedAudioBody {
                    entity_id,
                    timestamp,
                    loudness,
                    flags,
                    position,
                    rotation,
                    opus_payload,
                })
            }
            PacketType::InfoResponse => Packet::InfoResponse(InfoResponseBody {
                request_id: get_u128(&mut cur)?,
                motd: get_string(&mut cur)?,
                version: get_version(&mut cur)?,
                connected_clients: cur.read_u32::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
            }),
            PacketType::AcceptResponse => Packet::AcceptResponse(AcceptResponseBody {
                request_id: get_u128(&mut cur)?,
                entity_id: cur.read_i32::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
                server_public_key: get_bytes_field(&mut cur, 128)?,
            }),
            PacketType::DenyResponse => Packet::DenyResponse(DenyResponseBody {
                request_id: get_u128(&mut cur)?,
                reason: get_string(&mut cur)?,
            }),
            PacketType::EntityCreated => Packet::EntityCreated(EntityCreatedBody {
                entity_id: cur.read_i32::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
                name: get_string(&mut cur)?,
            }),
            PacketType::EntityDestroyed => Packet::EntityDestroyed(EntityDestroyedBody {
                entity_id: cur.read_i32::<BigEndian>().map_err(|_| FramingError::MalformedFrame)?,
            }),
            PacketType::EncryptedEnvelope => {
                if cur.remaining() < 28 {
                    return Err(FramingError::MalformedFrame);
                }
                let mut iv = [0u8; 12];
                cur.copy_to_slice(&mut iv);
                let mut tag = [0u8; 16];
                cur.copy_to_slice(&mut tag);
                let ciphertext = get_bytes_field(&mut cur, MAX_ENCODED_BYTES + 64)?;
                Packet::EncryptedEnvelope(EncryptedEnvelopeBody { iv, tag, ciphertext })
            }
        };
        Ok(packet)
    }
}

fn read_bool(cur: &mut Cursor<&[u8]>) -> Result<bool, FramingError> {
    Ok(cur.read_u8().map_err(|_| FramingError::MalformedFrame)? != 0)
}

//! PVA message framing and the fixed-layout message bodies.
//!
//! Every PVA message starts with an eight byte header:
//!
//! ```text
//! 0xCA | version | flags | command | payload size (u32)
//! ```
//!
//! followed by the payload. Only little-endian, unsegmented messages are
//! supported. Control messages (flag 0x01) carry their data in the size field
//! and have no payload.
//!
//! Bodies that contain pvData (operation results, pvRequests) depend on the
//! per-connection [`TypeRegistry`], so they are decoded by the connection that
//! owns it; this module handles their fixed prefix and leaves the rest as a
//! [`Bytes`] body.

use std::{
    fmt::Display,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult, Parser,
    number::complete::{le_u32, u8 as byte},
};
use rand::RngCore;
use thiserror::Error;

use crate::pvdata::{
    DecodeError, PvStructure, ScalarType, Structure, StructureDesc, TypeDescriptor, TypeMismatch,
    TypeRegistry, WireReader,
    codec::{decode_value, encode_value, put_size, put_string},
};

pub const PVA_MAGIC: u8 = 0xCA;
pub const PVA_VERSION: u8 = 2;
pub const HEADER_SIZE: usize = 8;
/// Refuse frames larger than this rather than allocating for them
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

pub const FLAG_CONTROL: u8 = 0x01;
pub const FLAG_SEGMENT_MASK: u8 = 0x30;
pub const FLAG_FROM_SERVER: u8 = 0x40;
pub const FLAG_BIG_ENDIAN: u8 = 0x80;

/// Control command asking the peer to use our byte order
pub const CONTROL_SET_BYTE_ORDER: u8 = 2;

/// Operation subcommands, as a bitmask
pub const SUBCMD_DEFAULT: u8 = 0x00;
pub const SUBCMD_INIT: u8 = 0x08;
pub const SUBCMD_DESTROY: u8 = 0x10;
pub const SUBCMD_GET: u8 = 0x40;
pub const SUBCMD_PIPELINE: u8 = 0x80;
pub const SUBCMD_MONITOR_START: u8 = 0x44;
pub const SUBCMD_MONITOR_STOP: u8 = 0x04;

const SEARCH_REPLY_REQUIRED: u8 = 0x01;
const SEARCH_UNICAST: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Beacon = 0,
    ConnectionValidation = 1,
    Echo = 2,
    Search = 3,
    SearchResponse = 4,
    CreateChannel = 7,
    DestroyChannel = 8,
    ConnectionValidated = 9,
    Get = 10,
    Put = 11,
    Monitor = 13,
    DestroyRequest = 15,
    GetField = 17,
    Message = 18,
    Rpc = 20,
    CancelRequest = 21,
}

impl TryFrom<u8> for Command {
    type Error = MessageError;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Command::Beacon,
            1 => Command::ConnectionValidation,
            2 => Command::Echo,
            3 => Command::Search,
            4 => Command::SearchResponse,
            7 => Command::CreateChannel,
            8 => Command::DestroyChannel,
            9 => Command::ConnectionValidated,
            10 => Command::Get,
            11 => Command::Put,
            13 => Command::Monitor,
            15 => Command::DestroyRequest,
            17 => Command::GetField,
            18 => Command::Message,
            20 => Command::Rpc,
            21 => Command::CancelRequest,
            unknown => return Err(MessageError::UnknownCommandId(unknown)),
        })
    }
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("IO Error Occured: {0}")]
    IO(#[from] io::Error),
    #[error("An error occured parsing a message header")]
    ParsingError,
    #[error("Invalid magic byte 0x{0:02X}")]
    InvalidMagic(u8),
    #[error("Big-endian peers are not supported")]
    BigEndian,
    #[error("Segmented messages are not supported")]
    Segmented,
    #[error("Frame of {0} bytes exceeds maximum size")]
    FrameTooLarge(usize),
    #[error("Unknown command ID: {0}")]
    UnknownCommandId(u8),
    #[error("Could not decode message: {0}")]
    Decode(#[from] DecodeError),
    #[error("Could not encode message: {0}")]
    Encode(#[from] TypeMismatch),
    #[error("Got a valid message but is not valid at this state: {0}")]
    UnexpectedMessage(String),
    #[error("Invalid message field: {0} == {1}")]
    InvalidField(String, String),
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for MessageError {
    fn from(_: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        MessageError::ParsingError
    }
}

/// The fixed header at the start of every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub command: u8,
    /// Payload length, or the control value for control messages
    pub payload_size: u32,
}

impl Header {
    pub fn parse(input: &[u8]) -> IResult<&[u8], Header> {
        let (input, (magic, version, flags, command, payload_size)) =
            (byte, byte, byte, byte, le_u32).parse(input)?;
        if magic != PVA_MAGIC {
            return Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )));
        }
        Ok((
            input,
            Header {
                version,
                flags,
                command,
                payload_size,
            },
        ))
    }

    /// Check the header is something we can process
    pub fn validate(&self) -> Result<(), MessageError> {
        if self.flags & FLAG_BIG_ENDIAN != 0 {
            return Err(MessageError::BigEndian);
        }
        if self.flags & FLAG_SEGMENT_MASK != 0 {
            return Err(MessageError::Segmented);
        }
        if !self.is_control() && self.payload_size as usize > MAX_PAYLOAD_SIZE {
            return Err(MessageError::FrameTooLarge(self.payload_size as usize));
        }
        Ok(())
    }

    pub fn is_control(&self) -> bool {
        self.flags & FLAG_CONTROL != 0
    }

    pub fn is_from_server(&self) -> bool {
        self.flags & FLAG_FROM_SERVER != 0
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u8(PVA_MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_u8(self.command);
        buf.put_u32_le(self.payload_size);
    }
}

/// A complete message: header plus undecoded payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(command: Command, from_server: bool, payload: impl Into<Bytes>) -> Frame {
        let payload = payload.into();
        Frame {
            header: Header {
                version: PVA_VERSION,
                flags: if from_server { FLAG_FROM_SERVER } else { 0 },
                command: command as u8,
                payload_size: payload.len() as u32,
            },
            payload,
        }
    }

    /// A control message, which has no payload
    pub fn control(command: u8, value: u32, from_server: bool) -> Frame {
        Frame {
            header: Header {
                version: PVA_VERSION,
                flags: FLAG_CONTROL | if from_server { FLAG_FROM_SERVER } else { 0 },
                command,
                payload_size: value,
            },
            payload: Bytes::new(),
        }
    }

    pub fn command(&self) -> Result<Command, MessageError> {
        Command::try_from(self.header.command)
    }

    pub fn reader(&self) -> WireReader<'_> {
        WireReader::new(&self.payload)
    }

    pub fn write(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_SIZE + self.payload.len());
        self.header.write(buf);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write(&mut buf);
        buf.freeze()
    }
}

/// Split a datagram into its messages
pub fn parse_frames(mut data: &[u8]) -> Result<Vec<Frame>, MessageError> {
    let mut frames = Vec::new();
    while !data.is_empty() {
        let (rest, header) = Header::parse(data)?;
        header.validate()?;
        let size = if header.is_control() {
            0
        } else {
            header.payload_size as usize
        };
        if rest.len() < size {
            return Err(MessageError::ParsingError);
        }
        frames.push(Frame {
            header,
            payload: Bytes::copy_from_slice(&rest[..size]),
        });
        data = &rest[size..];
    }
    Ok(frames)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusKind {
    #[default]
    Ok = 0,
    Warning = 1,
    Error = 2,
    Fatal = 3,
}

/// Outcome of an operation, as reported by a server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub kind: StatusKind,
    pub message: String,
    pub call_tree: String,
}

impl Status {
    pub fn ok() -> Status {
        Status::default()
    }

    pub fn error(message: impl Into<String>) -> Status {
        Status {
            kind: StatusKind::Error,
            message: message.into(),
            call_tree: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.kind, StatusKind::Ok | StatusKind::Warning)
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        if self.kind == StatusKind::Ok && self.message.is_empty() && self.call_tree.is_empty() {
            buf.put_u8(0xFF);
            return;
        }
        buf.put_u8(self.kind as u8);
        put_string(buf, &self.message);
        put_string(buf, &self.call_tree);
    }

    pub fn parse(reader: &mut WireReader) -> Result<Status, DecodeError> {
        let kind = match reader.u8()? {
            0xFF => return Ok(Status::ok()),
            0 => StatusKind::Ok,
            1 => StatusKind::Warning,
            2 => StatusKind::Error,
            _ => StatusKind::Fatal,
        };
        Ok(Status {
            kind,
            message: reader.string()?,
            call_tree: reader.string()?,
        })
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if !self.message.is_empty() {
            write!(f, ": {}", self.message)?;
        }
        Ok(())
    }
}

/// Unique identifier of a server instance, regenerated each time it starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Guid(pub [u8; 12]);

impl Guid {
    pub fn random() -> Guid {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Guid(bytes)
    }

    fn parse(reader: &mut WireReader) -> Result<Guid, DecodeError> {
        let mut bytes = [0u8; 12];
        bytes.copy_from_slice(reader.take(12)?);
        Ok(Guid(bytes))
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Addresses travel as 16 byte IPv6, with IPv4 as a mapped address
fn put_address(buf: &mut impl BufMut, address: IpAddr) {
    let v6 = match address {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    };
    buf.put_slice(&v6.octets());
}

fn read_address(reader: &mut WireReader) -> Result<IpAddr, DecodeError> {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(reader.take(16)?);
    let v6 = Ipv6Addr::from(octets);
    Ok(match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None if v6.is_unspecified() => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        None => IpAddr::V6(v6),
    })
}

/// Search for channels by name. An empty channel list asks every server
/// to identify itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub sequence: u32,
    pub reply_required: bool,
    pub unicast: bool,
    pub reply_address: IpAddr,
    pub reply_port: u16,
    pub protocols: Vec<String>,
    pub channels: Vec<(u32, String)>,
}

impl Default for SearchRequest {
    fn default() -> Self {
        SearchRequest {
            sequence: 0,
            reply_required: false,
            unicast: false,
            reply_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reply_port: 0,
            protocols: vec!["tcp".to_owned()],
            channels: Vec::new(),
        }
    }
}

impl SearchRequest {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.sequence);
        let mut flags = 0;
        if self.reply_required {
            flags |= SEARCH_REPLY_REQUIRED;
        }
        if self.unicast {
            flags |= SEARCH_UNICAST;
        }
        buf.put_u8(flags);
        buf.put_slice(&[0, 0, 0]);
        put_address(buf, self.reply_address);
        buf.put_u16_le(self.reply_port);
        put_size(buf, Some(self.protocols.len()));
        for protocol in &self.protocols {
            put_string(buf, protocol);
        }
        buf.put_u16_le(self.channels.len() as u16);
        for (cid, name) in &self.channels {
            buf.put_u32_le(*cid);
            put_string(buf, name);
        }
    }

    pub fn parse(reader: &mut WireReader) -> Result<SearchRequest, DecodeError> {
        let sequence = reader.u32()?;
        let flags = reader.u8()?;
        reader.take(3)?;
        let reply_address = read_address(reader)?;
        let reply_port = reader.u16()?;
        let protocol_count = reader.count(1)?;
        let protocols = (0..protocol_count)
            .map(|_| reader.string())
            .collect::<Result<Vec<_>, _>>()?;
        let channel_count = reader.u16()? as usize;
        let mut channels = Vec::with_capacity(channel_count.min(reader.remaining() / 5));
        for _ in 0..channel_count {
            channels.push((reader.u32()?, reader.string()?));
        }
        Ok(SearchRequest {
            sequence,
            reply_required: flags & SEARCH_REPLY_REQUIRED != 0,
            unicast: flags & SEARCH_UNICAST != 0,
            reply_address,
            reply_port,
            protocols,
            channels,
        })
    }

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        Frame::new(Command::Search, false, buf)
    }
}

/// A server's answer to a search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResponse {
    pub guid: Guid,
    pub sequence: u32,
    /// Where to connect. Unspecified means "the address this came from".
    pub server_address: IpAddr,
    pub server_port: u16,
    pub protocol: String,
    pub found: bool,
    pub cids: Vec<u32>,
}

impl SearchResponse {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.guid.0);
        buf.put_u32_le(self.sequence);
        put_address(buf, self.server_address);
        buf.put_u16_le(self.server_port);
        put_string(buf, &self.protocol);
        buf.put_u8(self.found as u8);
        buf.put_u16_le(self.cids.len() as u16);
        for cid in &self.cids {
            buf.put_u32_le(*cid);
        }
    }

    pub fn parse(reader: &mut WireReader) -> Result<SearchResponse, DecodeError> {
        let guid = Guid::parse(reader)?;
        let sequence = reader.u32()?;
        let server_address = read_address(reader)?;
        let server_port = reader.u16()?;
        let protocol = reader.string()?;
        let found = reader.u8()? != 0;
        let count = reader.u16()? as usize;
        let cids = (0..count)
            .map(|_| reader.u32())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SearchResponse {
            guid,
            sequence,
            server_address,
            server_port,
            protocol,
            found,
            cids,
        })
    }

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        Frame::new(Command::SearchResponse, true, buf)
    }
}

/// Periodic server announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub guid: Guid,
    pub flags: u8,
    pub sequence: u8,
    /// Bumped whenever the set of channels a server offers changes
    pub change_count: u16,
    pub server_address: IpAddr,
    pub server_port: u16,
    pub protocol: String,
}

impl Beacon {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.guid.0);
        buf.put_u8(self.flags);
        buf.put_u8(self.sequence);
        buf.put_u16_le(self.change_count);
        put_address(buf, self.server_address);
        buf.put_u16_le(self.server_port);
        put_string(buf, &self.protocol);
        // No server status structure
        buf.put_u8(0xFF);
    }

    pub fn parse(reader: &mut WireReader) -> Result<Beacon, DecodeError> {
        Ok(Beacon {
            guid: Guid::parse(reader)?,
            flags: reader.u8()?,
            sequence: reader.u8()?,
            change_count: reader.u16()?,
            server_address: read_address(reader)?,
            server_port: reader.u16()?,
            protocol: reader.string()?,
        })
    }

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        Frame::new(Command::Beacon, true, buf)
    }
}

/// Server's opening message on a new connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRequest {
    pub buffer_size: u32,
    pub registry_size: u16,
    pub auth_methods: Vec<String>,
}

impl ValidationRequest {
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.buffer_size);
        buf.put_u16_le(self.registry_size);
        put_size(&mut buf, Some(self.auth_methods.len()));
        for method in &self.auth_methods {
            put_string(&mut buf, method);
        }
        Frame::new(Command::ConnectionValidation, true, buf)
    }

    pub fn parse(reader: &mut WireReader) -> Result<ValidationRequest, DecodeError> {
        let buffer_size = reader.u32()?;
        let registry_size = reader.u16()?;
        let count = reader.count(1)?;
        let auth_methods = (0..count)
            .map(|_| reader.string())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ValidationRequest {
            buffer_size,
            registry_size,
            auth_methods,
        })
    }
}

/// Who a client says it is
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    #[default]
    Anonymous,
    /// The "ca" method: user and host name, taken on trust
    Ca { user: String, host: String },
}

impl ClientIdentity {
    pub fn method(&self) -> &'static str {
        match self {
            ClientIdentity::Anonymous => "anonymous",
            ClientIdentity::Ca { .. } => "ca",
        }
    }

    /// Identity of the current process
    pub fn current() -> ClientIdentity {
        let user = whoami::username();
        let host = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_owned());
        ClientIdentity::Ca { user, host }
    }

    fn identity_desc() -> StructureDesc {
        StructureDesc::new("")
            .field("user", TypeDescriptor::Scalar(ScalarType::String))
            .field("host", TypeDescriptor::Scalar(ScalarType::String))
    }
}

impl Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientIdentity::Anonymous => write!(f, "anonymous"),
            ClientIdentity::Ca { user, host } => write!(f, "{user}@{host}"),
        }
    }
}

/// Client's answer to the validation request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResponse {
    pub buffer_size: u32,
    pub registry_size: u16,
    pub qos: u16,
    pub identity: ClientIdentity,
}

impl ValidationResponse {
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.buffer_size);
        buf.put_u16_le(self.registry_size);
        buf.put_u16_le(self.qos);
        put_string(&mut buf, self.identity.method());
        // Identity data is self-contained, so never uses registry IDs
        let mut registry = TypeRegistry::with_capacity(0);
        match &self.identity {
            ClientIdentity::Anonymous => registry.encode_optional_type(None, &mut buf),
            ClientIdentity::Ca { user, host } => {
                let desc = TypeDescriptor::Structure(ClientIdentity::identity_desc());
                registry.encode_type(&desc, &mut buf);
                let value = Structure::new()
                    .with("user", user.as_str())
                    .with("host", host.as_str());
                // Layout is fixed above, so this cannot mismatch
                let _ = encode_value(&desc, &value.into(), &mut buf);
            }
        }
        Frame::new(Command::ConnectionValidation, false, buf)
    }

    pub fn parse(reader: &mut WireReader) -> Result<ValidationResponse, DecodeError> {
        let buffer_size = reader.u32()?;
        let registry_size = reader.u16()?;
        let qos = reader.u16()?;
        let method = reader.string()?;
        let mut identity = ClientIdentity::Anonymous;
        if !reader.is_empty() {
            let mut registry = TypeRegistry::new();
            if let Some(desc) = registry.decode_optional_type(reader)? {
                let value = decode_value(&desc, reader)?;
                if method == "ca" {
                    let field = |name| {
                        value
                            .as_structure()
                            .and_then(|s| s.get(name))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_owned()
                    };
                    identity = ClientIdentity::Ca {
                        user: field("user"),
                        host: field("host"),
                    };
                }
            }
        }
        Ok(ValidationResponse {
            buffer_size,
            registry_size,
            qos,
            identity,
        })
    }
}

/// Client request to create channels by name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannel {
    pub channels: Vec<(u32, String)>,
}

impl CreateChannel {
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u16_le(self.channels.len() as u16);
        for (cid, name) in &self.channels {
            buf.put_u32_le(*cid);
            put_string(&mut buf, name);
        }
        Frame::new(Command::CreateChannel, false, buf)
    }

    pub fn parse(reader: &mut WireReader) -> Result<CreateChannel, DecodeError> {
        let count = reader.u16()? as usize;
        let mut channels = Vec::with_capacity(count.min(reader.remaining() / 5));
        for _ in 0..count {
            channels.push((reader.u32()?, reader.string()?));
        }
        Ok(CreateChannel { channels })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateChannelResponse {
    pub cid: u32,
    pub sid: u32,
    pub status: Status,
}

impl CreateChannelResponse {
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.cid);
        buf.put_u32_le(self.sid);
        self.status.write(&mut buf);
        Frame::new(Command::CreateChannel, true, buf)
    }

    pub fn parse(reader: &mut WireReader) -> Result<CreateChannelResponse, DecodeError> {
        Ok(CreateChannelResponse {
            cid: reader.u32()?,
            sid: reader.u32()?,
            status: Status::parse(reader)?,
        })
    }
}

/// Sent by either side to close a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyChannel {
    pub sid: u32,
    pub cid: u32,
}

impl DestroyChannel {
    pub fn to_frame(&self, from_server: bool) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.sid);
        buf.put_u32_le(self.cid);
        Frame::new(Command::DestroyChannel, from_server, buf)
    }

    pub fn parse(reader: &mut WireReader) -> Result<DestroyChannel, DecodeError> {
        Ok(DestroyChannel {
            sid: reader.u32()?,
            cid: reader.u32()?,
        })
    }
}

/// Fixed prefix of a client request on a channel operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationRequest {
    pub command: Command,
    pub sid: u32,
    pub ioid: u32,
    pub subcommand: u8,
    /// Remaining payload, depending on command and subcommand
    pub body: Bytes,
}

impl OperationRequest {
    pub fn new(command: Command, sid: u32, ioid: u32, subcommand: u8) -> Self {
        OperationRequest {
            command,
            sid,
            ioid,
            subcommand,
            body: Bytes::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(9 + self.body.len());
        buf.put_u32_le(self.sid);
        buf.put_u32_le(self.ioid);
        buf.put_u8(self.subcommand);
        buf.put_slice(&self.body);
        Frame::new(self.command, false, buf)
    }

    pub fn parse(command: Command, reader: &mut WireReader) -> Result<Self, DecodeError> {
        Ok(OperationRequest {
            command,
            sid: reader.u32()?,
            ioid: reader.u32()?,
            subcommand: reader.u8()?,
            body: Bytes::copy_from_slice(reader.rest()),
        })
    }
}

/// Fixed prefix of a server response on a channel operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResponse {
    pub command: Command,
    pub ioid: u32,
    pub subcommand: u8,
    /// Absent only for monitor data updates
    pub status: Option<Status>,
    pub body: Bytes,
}

impl OperationResponse {
    /// Monitor updates are the one response that carries no status
    fn has_status(command: Command, subcommand: u8) -> bool {
        command != Command::Monitor || subcommand & (SUBCMD_INIT | SUBCMD_DESTROY) != 0
    }

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(6 + self.body.len());
        buf.put_u32_le(self.ioid);
        if self.command != Command::GetField {
            buf.put_u8(self.subcommand);
        }
        if Self::has_status(self.command, self.subcommand) {
            self.status.clone().unwrap_or_default().write(&mut buf);
        }
        buf.put_slice(&self.body);
        Frame::new(self.command, true, buf)
    }

    pub fn parse(command: Command, reader: &mut WireReader) -> Result<Self, DecodeError> {
        let ioid = reader.u32()?;
        // Type replies carry no subcommand
        let subcommand = if command == Command::GetField {
            0
        } else {
            reader.u8()?
        };
        let status = if Self::has_status(command, subcommand) {
            Some(Status::parse(reader)?)
        } else {
            None
        };
        Ok(OperationResponse {
            command,
            ioid,
            subcommand,
            status,
            body: Bytes::copy_from_slice(reader.rest()),
        })
    }
}

/// Request for the type of a channel, or a sub-field of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetFieldRequest {
    pub sid: u32,
    pub ioid: u32,
    pub sub_field: String,
}

impl GetFieldRequest {
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.sid);
        buf.put_u32_le(self.ioid);
        put_string(&mut buf, &self.sub_field);
        Frame::new(Command::GetField, false, buf)
    }

    pub fn parse(reader: &mut WireReader) -> Result<GetFieldRequest, DecodeError> {
        Ok(GetFieldRequest {
            sid: reader.u32()?,
            ioid: reader.u32()?,
            sub_field: reader.string()?,
        })
    }
}

/// Identifies a request when destroying or cancelling it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestIds {
    pub sid: u32,
    pub ioid: u32,
}

impl RequestIds {
    pub fn to_frame(&self, command: Command) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.sid);
        buf.put_u32_le(self.ioid);
        Frame::new(command, false, buf)
    }

    pub fn parse(reader: &mut WireReader) -> Result<RequestIds, DecodeError> {
        Ok(RequestIds {
            sid: reader.u32()?,
            ioid: reader.u32()?,
        })
    }
}

/// Diagnostic text sent by a server about a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerNotice {
    pub ioid: u32,
    pub kind: u8,
    pub message: String,
}

impl ServerNotice {
    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.ioid);
        buf.put_u8(self.kind);
        put_string(&mut buf, &self.message);
        Frame::new(Command::Message, true, buf)
    }

    pub fn parse(reader: &mut WireReader) -> Result<ServerNotice, DecodeError> {
        Ok(ServerNotice {
            ioid: reader.u32()?,
            kind: reader.u8()?,
            message: reader.string()?,
        })
    }
}

/// Write a type description and full value, as used for pvRequests and RPC
pub fn encode_structure(
    registry: &mut TypeRegistry,
    value: &PvStructure,
    buf: &mut BytesMut,
) -> Result<(), TypeMismatch> {
    registry.encode_type(value.type_descriptor(), buf);
    encode_value(
        value.type_descriptor(),
        &value.value().clone().into(),
        buf,
    )
}

/// Read a type description and full value
pub fn decode_structure(
    registry: &mut TypeRegistry,
    reader: &mut WireReader,
) -> Result<PvStructure, DecodeError> {
    let start = reader.offset();
    let desc = registry.decode_type(reader)?;
    let Some(structure_desc) = desc.as_structure() else {
        return Err(DecodeError {
            offset: start,
            kind: crate::pvdata::DecodeErrorKind::InvalidValue(
                "expected a structure".to_owned(),
            ),
        });
    };
    let value = crate::pvdata::codec::decode_structure(structure_desc, reader)?;
    Ok(PvStructure::new_unchecked(desc, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let frame = Frame::new(Command::Get, true, vec![1, 2, 3]);
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[..8], &[0xCA, 2, 0x40, 10, 3, 0, 0, 0]);
        let frames = parse_frames(&bytes).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_reject_bad_headers() {
        assert!(matches!(
            parse_frames(&[0xCB, 2, 0, 2, 0, 0, 0, 0]),
            Err(MessageError::ParsingError)
        ));
        let header = Header {
            version: 2,
            flags: FLAG_BIG_ENDIAN,
            command: 2,
            payload_size: 0,
        };
        assert!(matches!(header.validate(), Err(MessageError::BigEndian)));
        let header = Header {
            flags: 0x10,
            ..header
        };
        assert!(matches!(header.validate(), Err(MessageError::Segmented)));
    }

    #[test]
    fn test_search_round_trip() {
        let search = SearchRequest {
            sequence: 42,
            reply_required: true,
            reply_address: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4)),
            reply_port: 40000,
            channels: vec![(1, "demo".to_owned()), (2, "other".to_owned())],
            ..Default::default()
        };
        let frame = search.to_frame();
        let frames = parse_frames(&frame.to_bytes()).unwrap();
        assert_eq!(frames[0].command().unwrap(), Command::Search);
        let parsed = SearchRequest::parse(&mut frames[0].reader()).unwrap();
        assert_eq!(parsed, search);
    }

    #[test]
    fn test_search_response_and_beacon() {
        let response = SearchResponse {
            guid: Guid::random(),
            sequence: 7,
            server_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            server_port: 5075,
            protocol: "tcp".to_owned(),
            found: true,
            cids: vec![3, 9],
        };
        let mut buf = BytesMut::new();
        response.encode(&mut buf);
        assert_eq!(
            SearchResponse::parse(&mut WireReader::new(&buf)).unwrap(),
            response
        );

        let beacon = Beacon {
            guid: response.guid,
            flags: 0,
            sequence: 255,
            change_count: 3,
            server_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            server_port: 5075,
            protocol: "tcp".to_owned(),
        };
        let mut buf = BytesMut::new();
        beacon.encode(&mut buf);
        assert_eq!(Beacon::parse(&mut WireReader::new(&buf)).unwrap(), beacon);
    }

    #[test]
    fn test_validation_identity() {
        let response = ValidationResponse {
            buffer_size: 16384,
            registry_size: 32767,
            qos: 0,
            identity: ClientIdentity::Ca {
                user: "operator".to_owned(),
                host: "console1".to_owned(),
            },
        };
        let frame = response.to_frame();
        let parsed = ValidationResponse::parse(&mut frame.reader()).unwrap();
        assert_eq!(parsed, response);

        let anonymous = ValidationResponse {
            identity: ClientIdentity::Anonymous,
            ..response
        };
        let frame = anonymous.to_frame();
        assert_eq!(
            ValidationResponse::parse(&mut frame.reader()).unwrap(),
            anonymous
        );
    }

    #[test]
    fn test_status() {
        let mut buf = BytesMut::new();
        Status::ok().write(&mut buf);
        Status::error("No write access").write(&mut buf);
        assert_eq!(buf[0], 0xFF);
        let mut reader = WireReader::new(&buf);
        assert!(Status::parse(&mut reader).unwrap().is_success());
        let error = Status::parse(&mut reader).unwrap();
        assert!(!error.is_success());
        assert_eq!(error.message, "No write access");
    }

    #[test]
    fn test_monitor_update_has_no_status() {
        let update = OperationResponse {
            command: Command::Monitor,
            ioid: 5,
            subcommand: SUBCMD_DEFAULT,
            status: None,
            body: Bytes::from_static(&[1, 2]),
        };
        let frame = update.to_frame();
        assert_eq!(frame.payload.len(), 7);
        let parsed = OperationResponse::parse(Command::Monitor, &mut frame.reader()).unwrap();
        assert_eq!(parsed, update);

        let get = OperationResponse {
            command: Command::Get,
            status: Some(Status::ok()),
            ..update
        };
        let frame = get.to_frame();
        assert_eq!(frame.payload.len(), 8);
    }
}

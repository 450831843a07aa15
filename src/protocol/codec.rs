//! Payload codec for every supported command.
//!
//! [`ProtocolCodec`] builds request payloads and parses response payloads
//! on the host side, and does the mirror image (parse requests, craft
//! responses) for device emulation.  It owns the address width and the
//! RPV id → type map; both must be configured before traffic that needs
//! them is built or parsed.
//!
//! Addresses and length fields are big-endian.  RPV values are encoded
//! big-endian with their declared type.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::memory::MemoryRegion;

use super::commands::{
    CONNECT_MAGIC, CommControlSubfn, CommandId, DISCOVER_MAGIC, FIRMWARE_ID_LEN, GetInfoSubfn,
    MemoryControlSubfn, RegionType, ResponseCode,
};
use super::datatype::{EmbeddedDataType, Endianness, Value, decode_value, encode_value};
use super::frame::{Request, Response};

// ---------------------------------------------------------------------------
// Address width
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressSize {
    Bits8,
    Bits16,
    #[default]
    Bits32,
    Bits64,
}

impl AddressSize {
    /// Encoded size in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Self::Bits8 => 1,
            Self::Bits16 => 2,
            Self::Bits32 => 4,
            Self::Bits64 => 8,
        }
    }

    pub fn from_bytes(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Bits8),
            2 => Some(Self::Bits16),
            4 => Some(Self::Bits32),
            8 => Some(Self::Bits64),
            _ => None,
        }
    }

    pub fn max_address(self) -> u64 {
        match self {
            Self::Bits64 => u64::MAX,
            other => (1u64 << (other.bytes() * 8)) - 1,
        }
    }

    /// True when every byte of `[address, address + len)` is addressable.
    pub fn covers(self, address: u64, len: usize) -> bool {
        if len == 0 {
            return address <= self.max_address();
        }
        address
            .checked_add(len as u64 - 1)
            .is_some_and(|last| last <= self.max_address())
    }

    fn encode(self, address: u64, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        if address > self.max_address() {
            return Err(ProtocolError::AddressTooWide(address));
        }
        out.extend_from_slice(&address.to_be_bytes()[8 - self.bytes()..]);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Payload structures
// ---------------------------------------------------------------------------

/// `(address, length)` pair: a read request entry or a write ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub address: u64,
    pub len: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryBlock {
    pub address: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedBlock {
    pub address: u64,
    pub data: Vec<u8>,
    pub mask: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RpvDefinition {
    pub id: u16,
    pub dtype: EmbeddedDataType,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RpvValue {
    pub id: u16,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpvAck {
    pub id: u16,
    pub size: u8,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedFeatures {
    pub memory_write: bool,
    pub datalogging: bool,
    pub user_command: bool,
    pub sixtyfour_bits: bool,
}

impl SupportedFeatures {
    fn to_byte(self) -> u8 {
        (u8::from(self.memory_write) << 7)
            | (u8::from(self.datalogging) << 6)
            | (u8::from(self.user_command) << 5)
            | (u8::from(self.sixtyfour_bits) << 4)
    }

    fn from_byte(b: u8) -> Self {
        Self {
            memory_write: b & 0x80 != 0,
            datalogging: b & 0x40 != 0,
            user_command: b & 0x20 != 0,
            sixtyfour_bits: b & 0x10 != 0,
        }
    }
}

/// Link parameters the device reports through GetParams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceParams {
    /// Largest request payload the device accepts.
    pub max_rx_data_size: u16,
    /// Largest response payload the device emits.
    pub max_tx_data_size: u16,
    pub max_bitrate_bps: u32,
    pub heartbeat_timeout_us: u32,
    pub rx_timeout_us: u32,
    pub address_size: AddressSize,
}

impl Default for DeviceParams {
    fn default() -> Self {
        Self {
            max_rx_data_size: 128,
            max_tx_data_size: 128,
            max_bitrate_bps: 0,
            heartbeat_timeout_us: 5_000_000,
            rx_timeout_us: 50_000,
            address_size: AddressSize::Bits32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverInfo {
    pub protocol_major: u8,
    pub protocol_minor: u8,
    pub firmware_id: [u8; FIRMWARE_ID_LEN],
    pub display_name: String,
}

// ---------------------------------------------------------------------------
// Decoded payloads
// ---------------------------------------------------------------------------

/// A parsed response payload, one variant per (command, subfunction).
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    ProtocolVersion { major: u8, minor: u8 },
    SoftwareId([u8; FIRMWARE_ID_LEN]),
    SupportedFeatures(SupportedFeatures),
    SpecialRegionCount { readonly: u8, forbidden: u8 },
    SpecialRegionLocation { region_type: RegionType, index: u8, region: MemoryRegion },
    RpvCount(u16),
    RpvDefinition(Vec<RpvDefinition>),
    Discover(DiscoverInfo),
    Heartbeat { session_id: u32, challenge_response: u16 },
    GetParams(DeviceParams),
    Connect { session_id: u32 },
    Disconnect,
    ReadMemory(Vec<MemoryBlock>),
    WriteMemory(Vec<BlockHeader>),
    WriteMemoryMasked(Vec<BlockHeader>),
    ReadRpv(Vec<RpvValue>),
    WriteRpv(Vec<RpvAck>),
    UserCommand { subfn: u8, data: Vec<u8> },
}

/// A parsed request payload, as seen by the device.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestData {
    GetProtocolVersion,
    GetSoftwareId,
    GetSupportedFeatures,
    GetSpecialRegionCount,
    GetSpecialRegionLocation { region_type: RegionType, index: u8 },
    GetRpvCount,
    GetRpvDefinition { start: u16, count: u16 },
    Discover,
    Heartbeat { session_id: u32, challenge: u16 },
    GetParams,
    Connect,
    Disconnect { session_id: u32 },
    ReadMemory(Vec<BlockHeader>),
    WriteMemory(Vec<MemoryBlock>),
    WriteMemoryMasked(Vec<MaskedBlock>),
    ReadRpv(Vec<u16>),
    WriteRpv(Vec<RpvValue>),
    UserCommand { subfn: u8, data: Vec<u8> },
}

// ---------------------------------------------------------------------------
// Payload cursor
// ---------------------------------------------------------------------------

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
    err: ProtocolError,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], err: ProtocolError) -> Self {
        Self { buf, pos: 0, err }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(n).ok_or(self.err)?;
        let slice = self.buf.get(self.pos..end).ok_or(self.err)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn address(&mut self, size: AddressSize) -> Result<u64, ProtocolError> {
        Ok(self
            .take(size.bytes())?
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    fn finish(&self) -> Result<(), ProtocolError> {
        if self.is_empty() { Ok(()) } else { Err(self.err) }
    }
}

const BAD_REQUEST: ProtocolError = ProtocolError::MalformedRequest("bad payload length");
const BAD_RESPONSE: ProtocolError = ProtocolError::MalformedResponse("bad payload length");

fn block_len(len: usize) -> Result<u16, ProtocolError> {
    match u16::try_from(len) {
        Ok(0) | Err(_) => Err(ProtocolError::MalformedRequest("block length must be 1..=65535")),
        Ok(n) => Ok(n),
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ProtocolCodec {
    address_size: AddressSize,
    rpv_types: HashMap<u16, EmbeddedDataType>,
}

impl ProtocolCodec {
    pub fn new(address_size: AddressSize) -> Self {
        Self {
            address_size,
            rpv_types: HashMap::new(),
        }
    }

    pub fn address_size(&self) -> AddressSize {
        self.address_size
    }

    pub fn set_address_size(&mut self, address_size: AddressSize) {
        self.address_size = address_size;
    }

    /// Replace the RPV type map.
    pub fn set_rpv_definitions(&mut self, defs: impl IntoIterator<Item = RpvDefinition>) {
        self.rpv_types = defs.into_iter().map(|d| (d.id, d.dtype)).collect();
    }

    pub fn rpv_type(&self, id: u16) -> Option<EmbeddedDataType> {
        self.rpv_types.get(&id).copied()
    }

    fn rpv_type_checked(&self, id: u16) -> Result<EmbeddedDataType, ProtocolError> {
        self.rpv_type(id).ok_or(ProtocolError::UnknownRpvId(id))
    }

    // -- size helpers used by the schedulers --------------------------------

    /// Request bytes per block of a memory read.
    pub fn read_request_block_size(&self) -> usize {
        self.address_size.bytes() + 2
    }

    /// Response bytes per block of a memory read, excluding data.
    pub fn read_response_block_overhead(&self) -> usize {
        self.address_size.bytes() + 2
    }

    /// Request bytes to write `len` bytes in one block.
    pub fn write_request_block_size(&self, len: usize, masked: bool) -> usize {
        self.address_size.bytes() + 2 + if masked { 2 * len } else { len }
    }

    pub fn write_response_block_size(&self) -> usize {
        self.address_size.bytes() + 2
    }

    pub const RPV_REQUEST_SIZE_PER_ID: usize = 2;

    /// Response bytes for one RPV of type `dtype`.
    pub fn rpv_response_size(dtype: EmbeddedDataType) -> usize {
        2 + dtype.size()
    }

    // -- request builders ---------------------------------------------------

    pub fn get_protocol_version(&self) -> Request {
        Request::new(CommandId::GetInfo, GetInfoSubfn::ProtocolVersion as u8, Vec::new())
    }

    pub fn get_software_id(&self) -> Request {
        Request::new(CommandId::GetInfo, GetInfoSubfn::SoftwareId as u8, Vec::new())
    }

    pub fn get_supported_features(&self) -> Request {
        Request::new(CommandId::GetInfo, GetInfoSubfn::SupportedFeatures as u8, Vec::new())
    }

    pub fn get_special_region_count(&self) -> Request {
        Request::new(CommandId::GetInfo, GetInfoSubfn::SpecialMemoryRegionCount as u8, Vec::new())
    }

    pub fn get_special_region_location(&self, region_type: RegionType, index: u8) -> Request {
        Request::new(
            CommandId::GetInfo,
            GetInfoSubfn::SpecialMemoryRegionLocation as u8,
            vec![region_type as u8, index],
        )
    }

    pub fn get_rpv_count(&self) -> Request {
        Request::new(CommandId::GetInfo, GetInfoSubfn::RpvCount as u8, Vec::new())
    }

    pub fn get_rpv_definition(&self, start: u16, count: u16) -> Request {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&start.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        Request::new(CommandId::GetInfo, GetInfoSubfn::RpvDefinition as u8, payload)
    }

    pub fn comm_discover(&self) -> Request {
        Request::new(CommandId::CommControl, CommControlSubfn::Discover as u8, DISCOVER_MAGIC.to_vec())
    }

    pub fn comm_heartbeat(&self, session_id: u32, challenge: u16) -> Request {
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&session_id.to_be_bytes());
        payload.extend_from_slice(&challenge.to_be_bytes());
        Request::new(CommandId::CommControl, CommControlSubfn::Heartbeat as u8, payload)
    }

    pub fn comm_get_params(&self) -> Request {
        Request::new(CommandId::CommControl, CommControlSubfn::GetParams as u8, Vec::new())
    }

    pub fn comm_connect(&self) -> Request {
        Request::new(CommandId::CommControl, CommControlSubfn::Connect as u8, CONNECT_MAGIC.to_vec())
    }

    pub fn comm_disconnect(&self, session_id: u32) -> Request {
        Request::new(
            CommandId::CommControl,
            CommControlSubfn::Disconnect as u8,
            session_id.to_be_bytes().to_vec(),
        )
    }

    pub fn read_memory_request(&self, blocks: &[BlockHeader]) -> Result<Request, ProtocolError> {
        let mut payload = Vec::with_capacity(blocks.len() * self.read_request_block_size());
        for b in blocks {
            if b.len == 0 {
                return Err(ProtocolError::MalformedRequest("zero-length read"));
            }
            self.address_size.encode(b.address, &mut payload)?;
            payload.extend_from_slice(&b.len.to_be_bytes());
        }
        Ok(Request::new(CommandId::MemoryControl, MemoryControlSubfn::Read as u8, payload))
    }

    pub fn write_memory_request(&self, blocks: &[MemoryBlock]) -> Result<Request, ProtocolError> {
        let mut payload = Vec::new();
        for b in blocks {
            self.address_size.encode(b.address, &mut payload)?;
            payload.extend_from_slice(&block_len(b.data.len())?.to_be_bytes());
            payload.extend_from_slice(&b.data);
        }
        Ok(Request::new(CommandId::MemoryControl, MemoryControlSubfn::Write as u8, payload))
    }

    pub fn write_memory_masked_request(&self, blocks: &[MaskedBlock]) -> Result<Request, ProtocolError> {
        let mut payload = Vec::new();
        for b in blocks {
            if b.mask.len() != b.data.len() {
                return Err(ProtocolError::MalformedRequest("mask and data lengths differ"));
            }
            self.address_size.encode(b.address, &mut payload)?;
            payload.extend_from_slice(&block_len(b.data.len())?.to_be_bytes());
            payload.extend_from_slice(&b.data);
            payload.extend_from_slice(&b.mask);
        }
        Ok(Request::new(CommandId::MemoryControl, MemoryControlSubfn::WriteMasked as u8, payload))
    }

    pub fn read_rpv_request(&self, ids: &[u16]) -> Result<Request, ProtocolError> {
        let mut payload = Vec::with_capacity(ids.len() * Self::RPV_REQUEST_SIZE_PER_ID);
        for &id in ids {
            self.rpv_type_checked(id)?;
            payload.extend_from_slice(&id.to_be_bytes());
        }
        Ok(Request::new(CommandId::MemoryControl, MemoryControlSubfn::ReadRpv as u8, payload))
    }

    pub fn write_rpv_request(&self, values: &[RpvValue]) -> Result<Request, ProtocolError> {
        let mut payload = Vec::new();
        for v in values {
            let dtype = self.rpv_type_checked(v.id)?;
            payload.extend_from_slice(&v.id.to_be_bytes());
            payload.extend_from_slice(&encode_value(dtype, Endianness::Big, v.value)?);
        }
        Ok(Request::new(CommandId::MemoryControl, MemoryControlSubfn::WriteRpv as u8, payload))
    }

    pub fn user_command(&self, subfn: u8, data: Vec<u8>) -> Request {
        Request::new(CommandId::UserCommand, subfn, data)
    }

    // -- response parsing (host side) ---------------------------------------

    /// Decode `response` as the answer to `request`.
    pub fn parse_response(&self, request: &Request, response: &Response) -> Result<ResponseData, ProtocolError> {
        if !response.answers(request) {
            return Err(ProtocolError::MalformedResponse("response does not answer request"));
        }
        if response.code != ResponseCode::Ok {
            return Err(ProtocolError::NotOk(response.code));
        }
        let mut c = Cursor::new(&response.payload, BAD_RESPONSE);
        let data = match CommandId::try_from(response.command)? {
            CommandId::GetInfo => self.parse_get_info_response(response.subfn, &mut c)?,
            CommandId::CommControl => Self::parse_comm_response(response.subfn, &mut c)?,
            CommandId::MemoryControl => self.parse_memory_response(request, response.subfn, &mut c)?,
            CommandId::UserCommand => ResponseData::UserCommand {
                subfn: response.subfn,
                data: c.take(response.payload.len())?.to_vec(),
            },
            CommandId::DatalogControl => return Err(ProtocolError::UnknownCommand(response.command)),
        };
        c.finish()?;
        Ok(data)
    }

    fn parse_get_info_response(&self, subfn: u8, c: &mut Cursor<'_>) -> Result<ResponseData, ProtocolError> {
        Ok(match GetInfoSubfn::parse(subfn)? {
            GetInfoSubfn::ProtocolVersion => ResponseData::ProtocolVersion {
                major: c.u8()?,
                minor: c.u8()?,
            },
            GetInfoSubfn::SoftwareId => ResponseData::SoftwareId(firmware_id(c)?),
            GetInfoSubfn::SupportedFeatures => {
                ResponseData::SupportedFeatures(SupportedFeatures::from_byte(c.u8()?))
            }
            GetInfoSubfn::SpecialMemoryRegionCount => ResponseData::SpecialRegionCount {
                readonly: c.u8()?,
                forbidden: c.u8()?,
            },
            GetInfoSubfn::SpecialMemoryRegionLocation => {
                let region_type = RegionType::try_from(c.u8()?)
                    .map_err(|_| ProtocolError::MalformedResponse("unknown region type"))?;
                let index = c.u8()?;
                let start = c.address(self.address_size)?;
                let end = c.address(self.address_size)?;
                let region = MemoryRegion::from_inclusive(start, end)
                    .ok_or(ProtocolError::MalformedResponse("region end before start"))?;
                ResponseData::SpecialRegionLocation {
                    region_type,
                    index,
                    region,
                }
            }
            GetInfoSubfn::RpvCount => ResponseData::RpvCount(c.u16()?),
            GetInfoSubfn::RpvDefinition => {
                let mut defs = Vec::new();
                while !c.is_empty() {
                    let id = c.u16()?;
                    let dtype = EmbeddedDataType::from_id(c.u8()?)
                        .ok_or(ProtocolError::MalformedResponse("unknown data type"))?;
                    defs.push(RpvDefinition { id, dtype });
                }
                ResponseData::RpvDefinition(defs)
            }
        })
    }

    fn parse_comm_response(subfn: u8, c: &mut Cursor<'_>) -> Result<ResponseData, ProtocolError> {
        Ok(match CommControlSubfn::parse(subfn)? {
            CommControlSubfn::Discover => {
                if c.take(4)? != DISCOVER_MAGIC {
                    return Err(ProtocolError::MalformedResponse("bad discover magic"));
                }
                let protocol_major = c.u8()?;
                let protocol_minor = c.u8()?;
                let firmware_id = firmware_id(c)?;
                let name_len = c.u8()? as usize;
                let display_name = String::from_utf8_lossy(c.take(name_len)?).into_owned();
                ResponseData::Discover(DiscoverInfo {
                    protocol_major,
                    protocol_minor,
                    firmware_id,
                    display_name,
                })
            }
            CommControlSubfn::Heartbeat => ResponseData::Heartbeat {
                session_id: c.u32()?,
                challenge_response: c.u16()?,
            },
            CommControlSubfn::GetParams => ResponseData::GetParams(DeviceParams {
                max_rx_data_size: c.u16()?,
                max_tx_data_size: c.u16()?,
                max_bitrate_bps: c.u32()?,
                heartbeat_timeout_us: c.u32()?,
                rx_timeout_us: c.u32()?,
                address_size: AddressSize::from_bytes(c.u8()?)
                    .ok_or(ProtocolError::MalformedResponse("unsupported address size"))?,
            }),
            CommControlSubfn::Connect => {
                if c.take(4)? != CONNECT_MAGIC {
                    return Err(ProtocolError::MalformedResponse("bad connect magic"));
                }
                ResponseData::Connect { session_id: c.u32()? }
            }
            CommControlSubfn::Disconnect => ResponseData::Disconnect,
        })
    }

    fn parse_memory_response(
        &self,
        request: &Request,
        subfn: u8,
        c: &mut Cursor<'_>,
    ) -> Result<ResponseData, ProtocolError> {
        Ok(match MemoryControlSubfn::parse(subfn)? {
            MemoryControlSubfn::Read => {
                let expected = self.parse_read_request(&request.payload)?;
                let mut blocks = Vec::with_capacity(expected.len());
                for want in expected {
                    let address = c.address(self.address_size)?;
                    let len = c.u16()?;
                    if address != want.address || len != want.len {
                        return Err(ProtocolError::MalformedResponse("read block does not match request"));
                    }
                    blocks.push(MemoryBlock {
                        address,
                        data: c.take(len as usize)?.to_vec(),
                    });
                }
                ResponseData::ReadMemory(blocks)
            }
            MemoryControlSubfn::Write => ResponseData::WriteMemory(self.parse_acks(c)?),
            MemoryControlSubfn::WriteMasked => ResponseData::WriteMemoryMasked(self.parse_acks(c)?),
            MemoryControlSubfn::ReadRpv => {
                let mut values = Vec::new();
                while !c.is_empty() {
                    let id = c.u16()?;
                    let dtype = self.rpv_type_checked(id)?;
                    let value = decode_value(dtype, Endianness::Big, c.take(dtype.size())?)?;
                    values.push(RpvValue { id, value });
                }
                ResponseData::ReadRpv(values)
            }
            MemoryControlSubfn::WriteRpv => {
                let mut acks = Vec::new();
                while !c.is_empty() {
                    acks.push(RpvAck {
                        id: c.u16()?,
                        size: c.u8()?,
                    });
                }
                ResponseData::WriteRpv(acks)
            }
        })
    }

    fn parse_acks(&self, c: &mut Cursor<'_>) -> Result<Vec<BlockHeader>, ProtocolError> {
        let mut acks = Vec::new();
        while !c.is_empty() {
            acks.push(BlockHeader {
                address: c.address(self.address_size)?,
                len: c.u16()?,
            });
        }
        Ok(acks)
    }

    // -- request parsing (device side) --------------------------------------

    pub fn parse_request(&self, request: &Request) -> Result<RequestData, ProtocolError> {
        let mut c = Cursor::new(&request.payload, BAD_REQUEST);
        let data = match CommandId::try_from(request.command)? {
            CommandId::GetInfo => match GetInfoSubfn::parse(request.subfn)? {
                GetInfoSubfn::ProtocolVersion => RequestData::GetProtocolVersion,
                GetInfoSubfn::SoftwareId => RequestData::GetSoftwareId,
                GetInfoSubfn::SupportedFeatures => RequestData::GetSupportedFeatures,
                GetInfoSubfn::SpecialMemoryRegionCount => RequestData::GetSpecialRegionCount,
                GetInfoSubfn::SpecialMemoryRegionLocation => RequestData::GetSpecialRegionLocation {
                    region_type: RegionType::try_from(c.u8()?)?,
                    index: c.u8()?,
                },
                GetInfoSubfn::RpvCount => RequestData::GetRpvCount,
                GetInfoSubfn::RpvDefinition => RequestData::GetRpvDefinition {
                    start: c.u16()?,
                    count: c.u16()?,
                },
            },
            CommandId::CommControl => match CommControlSubfn::parse(request.subfn)? {
                CommControlSubfn::Discover => {
                    if c.take(4)? != DISCOVER_MAGIC {
                        return Err(ProtocolError::MalformedRequest("bad discover magic"));
                    }
                    RequestData::Discover
                }
                CommControlSubfn::Heartbeat => RequestData::Heartbeat {
                    session_id: c.u32()?,
                    challenge: c.u16()?,
                },
                CommControlSubfn::GetParams => RequestData::GetParams,
                CommControlSubfn::Connect => {
                    if c.take(4)? != CONNECT_MAGIC {
                        return Err(ProtocolError::MalformedRequest("bad connect magic"));
                    }
                    RequestData::Connect
                }
                CommControlSubfn::Disconnect => RequestData::Disconnect { session_id: c.u32()? },
            },
            CommandId::MemoryControl => match MemoryControlSubfn::parse(request.subfn)? {
                MemoryControlSubfn::Read => return self.parse_read_request(&request.payload).map(RequestData::ReadMemory),
                MemoryControlSubfn::Write => {
                    let mut blocks = Vec::new();
                    while !c.is_empty() {
                        let address = c.address(self.address_size)?;
                        let len = c.u16()? as usize;
                        blocks.push(MemoryBlock {
                            address,
                            data: c.take(len)?.to_vec(),
                        });
                    }
                    RequestData::WriteMemory(blocks)
                }
                MemoryControlSubfn::WriteMasked => {
                    let mut blocks = Vec::new();
                    while !c.is_empty() {
                        let address = c.address(self.address_size)?;
                        let len = c.u16()? as usize;
                        let data = c.take(len)?.to_vec();
                        let mask = c.take(len)?.to_vec();
                        blocks.push(MaskedBlock { address, data, mask });
                    }
                    RequestData::WriteMemoryMasked(blocks)
                }
                MemoryControlSubfn::ReadRpv => {
                    let mut ids = Vec::new();
                    while !c.is_empty() {
                        ids.push(c.u16()?);
                    }
                    RequestData::ReadRpv(ids)
                }
                MemoryControlSubfn::WriteRpv => {
                    let mut values = Vec::new();
                    while !c.is_empty() {
                        let id = c.u16()?;
                        let dtype = self.rpv_type_checked(id)?;
                        let value = decode_value(dtype, Endianness::Big, c.take(dtype.size())?)?;
                        values.push(RpvValue { id, value });
                    }
                    RequestData::WriteRpv(values)
                }
            },
            CommandId::UserCommand => RequestData::UserCommand {
                subfn: request.subfn,
                data: request.payload.clone(),
            },
            CommandId::DatalogControl => return Err(ProtocolError::UnknownCommand(request.command)),
        };
        if !matches!(data, RequestData::UserCommand { .. }) {
            c.finish()?;
        }
        Ok(data)
    }

    fn parse_read_request(&self, payload: &[u8]) -> Result<Vec<BlockHeader>, ProtocolError> {
        let mut c = Cursor::new(payload, BAD_REQUEST);
        let mut blocks = Vec::new();
        while !c.is_empty() {
            blocks.push(BlockHeader {
                address: c.address(self.address_size)?,
                len: c.u16()?,
            });
        }
        Ok(blocks)
    }

    // -- response crafting (device side) ------------------------------------

    fn ok(request: &Request, payload: Vec<u8>) -> Response {
        Response::new(request.command, request.subfn, ResponseCode::Ok, payload)
    }

    pub fn respond_protocol_version(&self, request: &Request, major: u8, minor: u8) -> Response {
        Self::ok(request, vec![major, minor])
    }

    pub fn respond_software_id(&self, request: &Request, firmware_id: &[u8; FIRMWARE_ID_LEN]) -> Response {
        Self::ok(request, firmware_id.to_vec())
    }

    pub fn respond_supported_features(&self, request: &Request, features: SupportedFeatures) -> Response {
        Self::ok(request, vec![features.to_byte()])
    }

    pub fn respond_special_region_count(&self, request: &Request, readonly: u8, forbidden: u8) -> Response {
        Self::ok(request, vec![readonly, forbidden])
    }

    pub fn respond_special_region_location(
        &self,
        request: &Request,
        region_type: RegionType,
        index: u8,
        region: MemoryRegion,
    ) -> Result<Response, ProtocolError> {
        let mut payload = vec![region_type as u8, index];
        self.address_size.encode(region.start, &mut payload)?;
        self.address_size.encode(region.last(), &mut payload)?;
        Ok(Self::ok(request, payload))
    }

    pub fn respond_rpv_count(&self, request: &Request, count: u16) -> Response {
        Self::ok(request, count.to_be_bytes().to_vec())
    }

    pub fn respond_rpv_definition(&self, request: &Request, defs: &[RpvDefinition]) -> Response {
        let mut payload = Vec::with_capacity(defs.len() * 3);
        for d in defs {
            payload.extend_from_slice(&d.id.to_be_bytes());
            payload.push(d.dtype.id());
        }
        Self::ok(request, payload)
    }

    pub fn respond_discover(&self, request: &Request, info: &DiscoverInfo) -> Response {
        let name = info.display_name.as_bytes();
        let name = &name[..name.len().min(u8::MAX as usize)];
        let mut payload = DISCOVER_MAGIC.to_vec();
        payload.push(info.protocol_major);
        payload.push(info.protocol_minor);
        payload.extend_from_slice(&info.firmware_id);
        payload.push(name.len() as u8);
        payload.extend_from_slice(name);
        Self::ok(request, payload)
    }

    /// Answer a heartbeat: the challenge comes back complemented.
    pub fn respond_heartbeat(&self, request: &Request, session_id: u32, challenge: u16) -> Response {
        let mut payload = session_id.to_be_bytes().to_vec();
        payload.extend_from_slice(&(!challenge).to_be_bytes());
        Self::ok(request, payload)
    }

    pub fn respond_get_params(&self, request: &Request, params: &DeviceParams) -> Response {
        let mut payload = Vec::with_capacity(17);
        payload.extend_from_slice(&params.max_rx_data_size.to_be_bytes());
        payload.extend_from_slice(&params.max_tx_data_size.to_be_bytes());
        payload.extend_from_slice(&params.max_bitrate_bps.to_be_bytes());
        payload.extend_from_slice(&params.heartbeat_timeout_us.to_be_bytes());
        payload.extend_from_slice(&params.rx_timeout_us.to_be_bytes());
        payload.push(params.address_size.bytes() as u8);
        Self::ok(request, payload)
    }

    pub fn respond_connect(&self, request: &Request, session_id: u32) -> Response {
        let mut payload = CONNECT_MAGIC.to_vec();
        payload.extend_from_slice(&session_id.to_be_bytes());
        Self::ok(request, payload)
    }

    pub fn respond_disconnect(&self, request: &Request) -> Response {
        Self::ok(request, Vec::new())
    }

    pub fn respond_read_memory(&self, request: &Request, blocks: &[MemoryBlock]) -> Result<Response, ProtocolError> {
        let mut payload = Vec::new();
        for b in blocks {
            self.address_size.encode(b.address, &mut payload)?;
            payload.extend_from_slice(&block_len(b.data.len())?.to_be_bytes());
            payload.extend_from_slice(&b.data);
        }
        Ok(Self::ok(request, payload))
    }

    /// Acknowledge a plain or masked memory write.
    pub fn respond_write_memory(&self, request: &Request, acks: &[BlockHeader]) -> Result<Response, ProtocolError> {
        let mut payload = Vec::with_capacity(acks.len() * self.write_response_block_size());
        for a in acks {
            self.address_size.encode(a.address, &mut payload)?;
            payload.extend_from_slice(&a.len.to_be_bytes());
        }
        Ok(Self::ok(request, payload))
    }

    pub fn respond_read_rpv(&self, request: &Request, values: &[RpvValue]) -> Result<Response, ProtocolError> {
        let mut payload = Vec::new();
        for v in values {
            let dtype = self.rpv_type_checked(v.id)?;
            payload.extend_from_slice(&v.id.to_be_bytes());
            payload.extend_from_slice(&encode_value(dtype, Endianness::Big, v.value)?);
        }
        Ok(Self::ok(request, payload))
    }

    pub fn respond_write_rpv(&self, request: &Request, acks: &[RpvAck]) -> Response {
        let mut payload = Vec::with_capacity(acks.len() * 3);
        for a in acks {
            payload.extend_from_slice(&a.id.to_be_bytes());
            payload.push(a.size);
        }
        Self::ok(request, payload)
    }

    pub fn respond_user_command(&self, request: &Request, data: Vec<u8>) -> Response {
        Self::ok(request, data)
    }
}

fn firmware_id(c: &mut Cursor<'_>) -> Result<[u8; FIRMWARE_ID_LEN], ProtocolError> {
    let mut id = [0u8; FIRMWARE_ID_LEN];
    id.copy_from_slice(c.take(FIRMWARE_ID_LEN)?);
    Ok(id)
}

//! Device protocol: command ids, framing, payload codec and value
//! encodings.
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌──────────────┐
//! │ datatype  │──▶│    codec     │──▶│    frame     │──▶ Link
//! │ (values)  │   │ (payloads)   │   │ (crc, split) │
//! └───────────┘   └──────────────┘   └──────────────┘
//! ```

pub mod codec;
pub mod commands;
pub mod datatype;
pub mod frame;

pub use codec::{
    AddressSize, BlockHeader, DeviceParams, DiscoverInfo, MaskedBlock, MemoryBlock, ProtocolCodec,
    RequestData, ResponseData, RpvAck, RpvDefinition, RpvValue, SupportedFeatures,
};
pub use commands::{
    CONNECT_MAGIC, CommControlSubfn, CommandId, DISCOVER_MAGIC, FIRMWARE_ID_LEN, GetInfoSubfn,
    MemoryControlSubfn, PROTOCOL_VERSION, RegionType, ResponseCode,
};
pub use datatype::{
    Bitfield, EmbeddedDataType, Endianness, Value, decode_bitfield, decode_value, encode_bitfield,
    encode_value,
};
pub use frame::{FrameDecoder, FrameKind, Request, Response};

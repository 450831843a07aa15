//! Command and subfunction identifiers, response codes and protocol
//! constants.

use core::fmt;

use crate::error::ProtocolError;

/// Protocol version implemented by this crate.
pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

/// Payload of a Discover request and prefix of its response.
pub const DISCOVER_MAGIC: [u8; 4] = [0x7E, 0x18, 0xFC, 0x68];

/// Payload of a Connect request and prefix of its response.
pub const CONNECT_MAGIC: [u8; 4] = [0x82, 0x90, 0x22, 0x66];

/// Length of the firmware id returned by Discover and GetSoftwareId.
pub const FIRMWARE_ID_LEN: usize = 16;

/// Response command byte is the request command with this bit set.
pub const RESPONSE_FLAG: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandId {
    GetInfo = 1,
    CommControl = 2,
    MemoryControl = 3,
    UserCommand = 4,
    DatalogControl = 5,
}

impl TryFrom<u8> for CommandId {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, ProtocolError> {
        match v {
            1 => Ok(Self::GetInfo),
            2 => Ok(Self::CommControl),
            3 => Ok(Self::MemoryControl),
            4 => Ok(Self::UserCommand),
            5 => Ok(Self::DatalogControl),
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Generates a `#[repr(u8)]` subfunction enum with a checked `u8`
/// conversion reporting the owning command on failure.
macro_rules! subfunctions {
    ($name:ident, $cmd:expr, { $($variant:ident = $val:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $val),+
        }

        impl $name {
            pub fn parse(v: u8) -> Result<Self, ProtocolError> {
                match v {
                    $($val => Ok(Self::$variant),)+
                    subfn => Err(ProtocolError::UnknownSubfunction {
                        command: $cmd as u8,
                        subfn,
                    }),
                }
            }
        }
    };
}

subfunctions!(GetInfoSubfn, CommandId::GetInfo, {
    ProtocolVersion = 1,
    SoftwareId = 2,
    SupportedFeatures = 3,
    SpecialMemoryRegionCount = 4,
    SpecialMemoryRegionLocation = 5,
    RpvCount = 6,
    RpvDefinition = 7,
});

subfunctions!(CommControlSubfn, CommandId::CommControl, {
    Discover = 1,
    Heartbeat = 2,
    GetParams = 3,
    Connect = 4,
    Disconnect = 5,
});

subfunctions!(MemoryControlSubfn, CommandId::MemoryControl, {
    Read = 1,
    Write = 2,
    WriteMasked = 3,
    ReadRpv = 4,
    WriteRpv = 5,
});

/// Status byte of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0,
    InvalidRequest = 1,
    UnsupportedFeature = 2,
    Overflow = 3,
    Busy = 4,
    FailureToProceed = 5,
    Forbidden = 6,
}

impl TryFrom<u8> for ResponseCode {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(Self::Ok),
            1 => Ok(Self::InvalidRequest),
            2 => Ok(Self::UnsupportedFeature),
            3 => Ok(Self::Overflow),
            4 => Ok(Self::Busy),
            5 => Ok(Self::FailureToProceed),
            6 => Ok(Self::Forbidden),
            other => Err(ProtocolError::UnknownResponseCode(other)),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ok => "OK",
            Self::InvalidRequest => "InvalidRequest",
            Self::UnsupportedFeature => "UnsupportedFeature",
            Self::Overflow => "Overflow",
            Self::Busy => "Busy",
            Self::FailureToProceed => "FailureToProceed",
            Self::Forbidden => "Forbidden",
        };
        f.write_str(s)
    }
}

/// Kind of special memory region reported by GetInfo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegionType {
    ReadOnly = 0,
    Forbidden = 1,
}

impl TryFrom<u8> for RegionType {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, ProtocolError> {
        match v {
            0 => Ok(Self::ReadOnly),
            1 => Ok(Self::Forbidden),
            _ => Err(ProtocolError::MalformedRequest("unknown region type")),
        }
    }
}

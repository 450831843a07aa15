//! In-process device emulator.
//!
//! [`EmulatedDevice`] answers framed requests the way a target running
//! the debug agent would.  It implements [`Link`] from the host's point
//! of view: bytes sent to it are requests, bytes received from it are
//! responses.  Each complete request is answered synchronously, so the
//! response is available on the next `recv()`.
//!
//! Memory is a data-retaining [`ByteRangeStore`]; bytes never written
//! read back as zero.  Failure injection (`drop_next`, `fail_next`,
//! `corrupt_next`) lets tests exercise timeout and error paths.

use std::collections::BTreeMap;

use log::{debug, trace, warn};

use crate::app::ports::{Link, LinkError};
use crate::error::ProtocolError;
use crate::memory::{ByteRangeStore, RegionMap};
use crate::protocol::{
    BlockHeader, DeviceParams, DiscoverInfo, EmbeddedDataType, FIRMWARE_ID_LEN, FrameDecoder, FrameKind,
    MemoryBlock, PROTOCOL_VERSION, ProtocolCodec, RegionType, Request, RequestData, Response, ResponseCode,
    RpvAck, RpvDefinition, RpvValue, SupportedFeatures, Value,
};

// ───────────────────────────────────────────────────────────────
// EmulatedDevice
// ───────────────────────────────────────────────────────────────

pub struct EmulatedDevice {
    codec: ProtocolCodec,
    params: DeviceParams,
    regions: RegionMap,
    features: SupportedFeatures,
    firmware_id: [u8; FIRMWARE_ID_LEN],
    display_name: String,
    memory: ByteRangeStore,
    rpvs: BTreeMap<u16, (EmbeddedDataType, Value)>,
    session: Option<u32>,
    next_session: u32,
    decoder: FrameDecoder,
    outbox: Vec<u8>,
    up: bool,
    history: Vec<RequestData>,
    drop_next: usize,
    fail_next: Option<ResponseCode>,
    corrupt_next: bool,
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new(DeviceParams::default(), RegionMap::default())
    }
}

impl EmulatedDevice {
    pub fn new(params: DeviceParams, regions: RegionMap) -> Self {
        Self {
            codec: ProtocolCodec::new(params.address_size),
            params,
            regions,
            features: SupportedFeatures {
                memory_write: true,
                datalogging: false,
                user_command: true,
                sixtyfour_bits: true,
            },
            firmware_id: [0; FIRMWARE_ID_LEN],
            display_name: "emulated".into(),
            memory: ByteRangeStore::with_data(),
            rpvs: BTreeMap::new(),
            session: None,
            next_session: 0x1000,
            decoder: FrameDecoder::new(FrameKind::Request, params.max_rx_data_size as usize),
            outbox: Vec::new(),
            up: true,
            history: Vec::new(),
            drop_next: 0,
            fail_next: None,
            corrupt_next: false,
        }
    }

    #[must_use]
    pub fn with_firmware_id(mut self, firmware_id: [u8; FIRMWARE_ID_LEN]) -> Self {
        self.firmware_id = firmware_id;
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn params(&self) -> DeviceParams {
        self.params
    }

    pub fn regions(&self) -> &RegionMap {
        &self.regions
    }

    // ── Device state ──────────────────────────────────────────

    /// Poke bytes into device memory, bypassing region checks.
    pub fn write_memory(&mut self, address: u64, data: &[u8]) {
        if let Err(e) = self.memory.write(address, data) {
            warn!("Device: poke at 0x{:X} refused: {}", address, e);
        }
    }

    /// Peek device memory; unwritten bytes read as zero.
    pub fn read_memory(&self, address: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| {
                let a = address.wrapping_add(i);
                self.memory.read(a, 1).map_or(0, |b| b[0])
            })
            .collect()
    }

    pub fn add_rpv(&mut self, id: u16, dtype: EmbeddedDataType, value: Value) {
        self.rpvs.insert(id, (dtype, value));
        self.codec.set_rpv_definitions(self.rpv_definitions());
    }

    pub fn set_rpv(&mut self, id: u16, value: Value) {
        if let Some(slot) = self.rpvs.get_mut(&id) {
            slot.1 = value;
        }
    }

    pub fn rpv(&self, id: u16) -> Option<Value> {
        self.rpvs.get(&id).map(|(_, v)| *v)
    }

    pub fn rpv_definitions(&self) -> Vec<RpvDefinition> {
        self.rpvs
            .iter()
            .map(|(&id, &(dtype, _))| RpvDefinition { id, dtype })
            .collect()
    }

    pub fn session(&self) -> Option<u32> {
        self.session
    }

    /// Take the link down or bring it back up.  Going down drops any
    /// partial request and unread response.
    pub fn set_up(&mut self, up: bool) {
        self.up = up;
        if !up {
            self.decoder.reset();
            self.outbox.clear();
        }
    }

    // ── Failure injection ─────────────────────────────────────

    /// Swallow the next `n` requests without answering.
    pub fn drop_next(&mut self, n: usize) {
        self.drop_next = n;
    }

    /// Answer the next request with `code` instead of handling it.
    pub fn fail_next(&mut self, code: ResponseCode) {
        self.fail_next = Some(code);
    }

    /// Flip a CRC bit in the next response.
    pub fn corrupt_next(&mut self) {
        self.corrupt_next = true;
    }

    // ── Introspection ─────────────────────────────────────────

    /// Every well-formed request received, oldest first.
    pub fn history(&self) -> &[RequestData] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Blocks of every memory read received.
    pub fn memory_reads(&self) -> Vec<BlockHeader> {
        self.history
            .iter()
            .filter_map(|r| match r {
                RequestData::ReadMemory(blocks) => Some(blocks.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    // ── Request handling ──────────────────────────────────────

    fn on_frame(&mut self, frame: &[u8]) {
        let request = match Request::from_bytes(frame) {
            Ok(r) => r,
            Err(e) => {
                warn!("Device: dropping bad frame: {}", e);
                return;
            }
        };
        if self.drop_next > 0 {
            self.drop_next -= 1;
            debug!("Device: dropping cmd={} subfn={}", request.command, request.subfn);
            return;
        }
        let response = self.handle(&request);
        match response.to_bytes() {
            Ok(mut bytes) => {
                if std::mem::take(&mut self.corrupt_next) {
                    if let Some(last) = bytes.last_mut() {
                        *last ^= 0x01;
                    }
                }
                self.outbox.extend_from_slice(&bytes);
            }
            Err(e) => warn!("Device: cannot encode response: {}", e),
        }
    }

    fn handle(&mut self, request: &Request) -> Response {
        let data = match self.codec.parse_request(request) {
            Ok(d) => d,
            Err(e) => {
                warn!("Device: bad request: {}", e);
                let code = match e {
                    ProtocolError::UnknownCommand(_) | ProtocolError::UnknownSubfunction { .. } => {
                        ResponseCode::UnsupportedFeature
                    }
                    _ => ResponseCode::InvalidRequest,
                };
                return Response::failure(request, code);
            }
        };
        trace!("Device: {:?}", data);
        self.history.push(data.clone());
        if let Some(code) = self.fail_next.take() {
            return Response::failure(request, code);
        }
        self.respond(request, data)
            .unwrap_or_else(|code| Response::failure(request, code))
    }

    fn respond(&mut self, request: &Request, data: RequestData) -> Result<Response, ResponseCode> {
        let codec = &self.codec;
        let response = match data {
            RequestData::GetProtocolVersion => {
                codec.respond_protocol_version(request, PROTOCOL_VERSION.0, PROTOCOL_VERSION.1)
            }
            RequestData::GetSoftwareId => codec.respond_software_id(request, &self.firmware_id),
            RequestData::GetSupportedFeatures => codec.respond_supported_features(request, self.features),
            RequestData::GetSpecialRegionCount => codec.respond_special_region_count(
                request,
                count_u8(self.regions.readonly.len()),
                count_u8(self.regions.forbidden.len()),
            ),
            RequestData::GetSpecialRegionLocation { region_type, index } => {
                let list = match region_type {
                    RegionType::ReadOnly => &self.regions.readonly,
                    RegionType::Forbidden => &self.regions.forbidden,
                };
                let region = *list.get(usize::from(index)).ok_or(ResponseCode::InvalidRequest)?;
                codec
                    .respond_special_region_location(request, region_type, index, region)
                    .map_err(|_| ResponseCode::FailureToProceed)?
            }
            RequestData::GetRpvCount => codec.respond_rpv_count(request, self.rpvs.len() as u16),
            RequestData::GetRpvDefinition { start, count } => {
                let defs: Vec<RpvDefinition> = self
                    .rpv_definitions()
                    .into_iter()
                    .skip(usize::from(start))
                    .take(usize::from(count))
                    .collect();
                if defs.len() * 3 > self.params.max_tx_data_size as usize {
                    return Err(ResponseCode::Overflow);
                }
                codec.respond_rpv_definition(request, &defs)
            }
            RequestData::Discover => codec.respond_discover(
                request,
                &DiscoverInfo {
                    protocol_major: PROTOCOL_VERSION.0,
                    protocol_minor: PROTOCOL_VERSION.1,
                    firmware_id: self.firmware_id,
                    display_name: self.display_name.clone(),
                },
            ),
            RequestData::Heartbeat { session_id, challenge } => {
                if self.session != Some(session_id) {
                    return Err(ResponseCode::InvalidRequest);
                }
                codec.respond_heartbeat(request, session_id, challenge)
            }
            RequestData::GetParams => codec.respond_get_params(request, &self.params),
            RequestData::Connect => {
                if self.session.is_some() {
                    return Err(ResponseCode::Busy);
                }
                let session = self.next_session;
                self.next_session = self.next_session.wrapping_add(1);
                self.session = Some(session);
                debug!("Device: session 0x{:08X} opened", session);
                self.codec.respond_connect(request, session)
            }
            RequestData::Disconnect { session_id } => {
                if self.session == Some(session_id) {
                    self.session = None;
                }
                codec.respond_disconnect(request)
            }
            RequestData::ReadMemory(blocks) => self.read_blocks(request, &blocks)?,
            RequestData::WriteMemory(blocks) => {
                let acks = self.check_writes(blocks.iter().map(|b| (b.address, b.data.len())))?;
                for b in &blocks {
                    self.write_memory(b.address, &b.data);
                }
                self.codec
                    .respond_write_memory(request, &acks)
                    .map_err(|_| ResponseCode::FailureToProceed)?
            }
            RequestData::WriteMemoryMasked(blocks) => {
                let acks = self.check_writes(blocks.iter().map(|b| (b.address, b.data.len())))?;
                for b in &blocks {
                    let merged: Vec<u8> = self
                        .read_memory(b.address, b.data.len())
                        .iter()
                        .zip(b.data.iter().zip(&b.mask))
                        .map(|(old, (new, mask))| (old & !mask) | (new & mask))
                        .collect();
                    self.write_memory(b.address, &merged);
                }
                self.codec
                    .respond_write_memory(request, &acks)
                    .map_err(|_| ResponseCode::FailureToProceed)?
            }
            RequestData::ReadRpv(ids) => {
                let values = ids
                    .iter()
                    .map(|id| {
                        self.rpvs
                            .get(id)
                            .map(|&(_, value)| RpvValue { id: *id, value })
                            .ok_or(ResponseCode::InvalidRequest)
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let size: usize = values
                    .iter()
                    .filter_map(|v| self.rpvs.get(&v.id))
                    .map(|(dtype, _)| ProtocolCodec::rpv_response_size(*dtype))
                    .sum();
                if size > self.params.max_tx_data_size as usize {
                    return Err(ResponseCode::Overflow);
                }
                codec
                    .respond_read_rpv(request, &values)
                    .map_err(|_| ResponseCode::FailureToProceed)?
            }
            RequestData::WriteRpv(values) => {
                let mut acks = Vec::with_capacity(values.len());
                for v in &values {
                    let slot = self.rpvs.get_mut(&v.id).ok_or(ResponseCode::InvalidRequest)?;
                    slot.1 = v.value;
                    acks.push(RpvAck {
                        id: v.id,
                        size: slot.0.size() as u8,
                    });
                }
                self.codec.respond_write_rpv(request, &acks)
            }
            RequestData::UserCommand { data, .. } => {
                if !self.features.user_command {
                    return Err(ResponseCode::UnsupportedFeature);
                }
                codec.respond_user_command(request, data)
            }
        };
        Ok(response)
    }

    fn read_blocks(&self, request: &Request, blocks: &[BlockHeader]) -> Result<Response, ResponseCode> {
        let mut out = Vec::with_capacity(blocks.len());
        let mut size = 0;
        for b in blocks {
            if self.regions.is_forbidden(b.address, u64::from(b.len)) {
                warn!("Device: read of forbidden memory at 0x{:X}", b.address);
                return Err(ResponseCode::Forbidden);
            }
            size += self.codec.read_response_block_overhead() + usize::from(b.len);
            out.push(MemoryBlock {
                address: b.address,
                data: self.read_memory(b.address, usize::from(b.len)),
            });
        }
        if size > self.params.max_tx_data_size as usize {
            return Err(ResponseCode::Overflow);
        }
        self.codec
            .respond_read_memory(request, &out)
            .map_err(|_| ResponseCode::FailureToProceed)
    }

    fn check_writes(&self, blocks: impl Iterator<Item = (u64, usize)>) -> Result<Vec<BlockHeader>, ResponseCode> {
        if !self.features.memory_write {
            return Err(ResponseCode::UnsupportedFeature);
        }
        blocks
            .map(|(address, len)| {
                if !self.regions.is_writable(address, len as u64) {
                    warn!("Device: write to protected memory at 0x{:X}", address);
                    return Err(ResponseCode::Forbidden);
                }
                let len = u16::try_from(len).map_err(|_| ResponseCode::Overflow)?;
                Ok(BlockHeader { address, len })
            })
            .collect()
    }
}

fn count_u8(n: usize) -> u8 {
    u8::try_from(n).unwrap_or(u8::MAX)
}

impl Link for EmulatedDevice {
    fn send(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.up {
            return Err(LinkError::Down);
        }
        self.decoder.feed(bytes);
        while let Some(frame) = self.decoder.next_frame() {
            match frame {
                Ok(frame) => self.on_frame(&frame),
                Err(e) => warn!("Device: framing error: {}", e),
            }
        }
        Ok(())
    }

    fn recv(&mut self) -> Option<Vec<u8>> {
        if self.outbox.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.outbox))
        }
    }

    fn is_up(&self) -> bool {
        self.up
    }
}

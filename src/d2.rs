/*! D2 protocol: framing codec, canned messages, request processing.

D2 is a request/response protocol where every message travels on CAN id
[`D2_CAN_ID`] and the first payload byte classifies the frame:

* `0xC8 + len`: single frame carrying `len` logical bytes,
* `0x88 + 7`: first frame of a series (always full),
* `0x09..=0x0F, 0x08, ...`: continuation with a cycling series nibble,
* `0x48 + len`: final frame of a series.

The logical bytes are `[ecu_id] ++ service ++ params`. Responses echo
the ECU id and the service byte plus `0x40`.

"Raw" messages (bootloader commands) skip the framing header entirely:
the first payload byte is the ECU id itself.
*/
use log::trace;

use crate::adapter::{CanFrame, Channel, Message, ReadStep};
use crate::{Error, Result, be32};

/// CAN identifier every D2 message travels on.
pub const D2_CAN_ID: u32 = 0x000F_FFFE;

/// Broadcast ECU id for bus-wide raw commands.
pub const ECU_BROADCAST: u8 = 0xFF;

/// D2 ECU addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum EcuKind {
    Adm = 0x0B,
    Aem = 0x52,
    Aud = 0x6D,
    Bcm = 0x01,
    Ccm = 0x29,
    Cem = 0x50,
    TcmP3 = 0x18,
    Ddm = 0x43,
    Dem = 0x1A,
    Dim = 0x51,
    EcmMe = 0x7A,
    Eps = 0x30,
    Gps = 0x72,
    Iam = 0x75,
    Icm = 0x54,
    Kvm = 0x2D,
    Mmm = 0x66,
    Pam = 0x63,
    Pdm = 0x45,
    Phm = 0x64,
    Psm = 0x2E,
    Srs = 0x58,
    Sub = 0x68,
    Swm = 0x49,
    Tcm = 0x6E,
    Tmc = 0x73,
    Trm = 0x23,
}

/// Classify a sender by the first four payload bytes.
///
/// The two magic prefixes are platform-specific captures; everything
/// else is attributed to the CEM.
pub fn ecu_kind_from_prefix(buffer: &[u8]) -> EcuKind {
    if buffer.len() >= 4 && buffer[0] == 0x01 && buffer[1] == 0x20 && buffer[2] == 0x00 {
        match buffer[3] {
            0x05 => return EcuKind::Tcm,
            0x21 => return EcuKind::EcmMe,
            _ => {}
        }
    }
    EcuKind::Cem
}

/// Human-readable description for a D2 negative-response code.
pub fn nrc_description(code: u8) -> &'static str {
    match code {
        0x10 => "Generic error",
        0x11 => "Service not supported",
        0x12 => "Sub function not supported or invalid message format",
        0x21 => "Busy, repeat request",
        0x22 => "Conditions not correct",
        0x23 => "Request action not yet completed",
        0x31 => "Request out of range",
        0x33 => "Security access denied",
        0x63 => "Abnormal stop",
        0x80 => "Access level too low",
        0x81 => "Busy bus",
        0x82 => "DTCs stored again",
        0x83 => "Memory not erased",
        0x84 | 0x85 | 0x86 => "Request action not yet completed",
        _ => "Unknown negative response",
    }
}

const MAX_SINGLE_PAYLOAD: usize = 7;

/// Advance the series nibble: 0x09, 0x0A, ... 0x0F, 0x08, 0x09, ...
fn next_series(series: u8) -> u8 {
    ((series - 8) + 1) % 8 + 8
}

/// One D2 message: the 8-byte CAN payloads plus the request identity
/// used to correlate the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct D2Message {
    ecu_id: u8,
    request_id: Vec<u8>,
    payloads: Vec<[u8; 8]>,
}

impl D2Message {
    /// Frame a request of `service` bytes and parameters for an ECU.
    pub fn new(ecu_id: u8, service: &[u8], params: &[u8]) -> Self {
        let mut logical = Vec::with_capacity(1 + service.len() + params.len());
        logical.push(ecu_id);
        logical.extend_from_slice(service);
        logical.extend_from_slice(params);
        let payloads = frame_logical(&logical);
        Self {
            ecu_id,
            request_id: service.to_vec(),
            payloads,
        }
    }

    /// A raw (unframed) bootloader command: `[ecu_id] ++ request`,
    /// zero-padded to 8 bytes.
    pub fn raw(ecu_id: u8, request: &[u8]) -> Result<Self> {
        if request.len() >= 8 {
            return Err(Error::invalid(format!(
                "raw message length {} >= 8",
                request.len() + 1
            )));
        }
        let mut payload = [0u8; 8];
        payload[0] = ecu_id;
        payload[1..1 + request.len()].copy_from_slice(request);
        Ok(Self {
            ecu_id,
            request_id: request.to_vec(),
            payloads: vec![payload],
        })
    }

    /// A message from pre-built raw payloads (bootloader data batches).
    pub fn from_payloads(ecu_id: u8, payloads: Vec<[u8; 8]>) -> Self {
        Self {
            ecu_id,
            request_id: Vec::new(),
            payloads,
        }
    }

    /// Target ECU id.
    pub fn ecu_id(&self) -> u8 {
        self.ecu_id
    }

    /// Service bytes used for response correlation.
    pub fn request_id(&self) -> &[u8] {
        &self.request_id
    }

    /// The 8-byte CAN payloads, in send order.
    pub fn payloads(&self) -> &[[u8; 8]] {
        &self.payloads
    }
}

impl Message for D2Message {
    fn to_frames(&self) -> Vec<CanFrame> {
        self.payloads
            .iter()
            .map(|p| CanFrame::new(D2_CAN_ID, p))
            .collect()
    }
}

fn frame_logical(logical: &[u8]) -> Vec<[u8; 8]> {
    let mut payloads = Vec::new();
    if logical.len() <= MAX_SINGLE_PAYLOAD {
        let mut payload = [0u8; 8];
        payload[0] = 0xC8 + logical.len() as u8;
        payload[1..1 + logical.len()].copy_from_slice(logical);
        payloads.push(payload);
        return payloads;
    }
    let mut series = 0x08u8;
    let mut offset = 0usize;
    let mut first = true;
    while offset < logical.len() {
        let take = (logical.len() - offset).min(MAX_SINGLE_PAYLOAD);
        let last = offset + take == logical.len();
        let header = if first {
            0x88 + take as u8
        } else if last {
            0x48 + take as u8
        } else {
            series = next_series(series);
            series
        };
        let mut payload = [0u8; 8];
        payload[0] = header;
        payload[1..1 + take].copy_from_slice(&logical[offset..offset + take]);
        payloads.push(payload);
        offset += take;
        first = false;
    }
    payloads
}

/// Incremental decoder for a D2 frame series, working on the 8-byte CAN
/// payloads. Collects the logical bytes and validates the cycling
/// series nibble.
#[derive(Debug, Default)]
pub struct SeriesDecoder {
    started: bool,
    in_series: bool,
    expected: u8,
    data: Vec<u8>,
}

impl SeriesDecoder {
    /// Fresh decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one received payload. Returns [`ReadStep::Done`] when the
    /// message is complete.
    pub fn feed(&mut self, payload: &[u8]) -> Result<ReadStep> {
        if payload.is_empty() {
            return Err(Error::frame("empty D2 payload"));
        }
        let header = payload[0];
        if !self.started {
            self.started = true;
            // Bitwise tests: bit 7 marks first-of-anything, bit 6 marks
            // a self-contained frame.
            if header & 0x80 == 0 {
                return Err(Error::frame(format!("unexpected D2 header {header:#04x}")));
            }
            if header & 0x40 != 0 {
                // Single frame, 0xC8 + len.
                let len = (header - 0xC8) as usize;
                if len > MAX_SINGLE_PAYLOAD || 1 + len > payload.len() {
                    return Err(Error::frame(format!("bad single-frame length {len}")));
                }
                self.data.extend_from_slice(&payload[1..1 + len]);
                return Ok(ReadStep::Done);
            }
            // First of a series, 0x88 + 7.
            self.in_series = true;
            self.expected = 0x09;
            self.data.extend_from_slice(&payload[1..8.min(payload.len())]);
            return Ok(ReadStep::Continue);
        }
        if !self.in_series {
            return Err(Error::frame("frame after end of series"));
        }
        if header & 0x40 != 0 {
            if header < 0x48 {
                return Err(Error::frame(format!("bad final-frame header {header:#04x}")));
            }
            let len = (header - 0x48) as usize;
            if len > MAX_SINGLE_PAYLOAD || 1 + len > payload.len() {
                return Err(Error::frame(format!("bad final-frame length {len}")));
            }
            self.data.extend_from_slice(&payload[1..1 + len]);
            self.in_series = false;
            return Ok(ReadStep::Done);
        }
        if header != self.expected {
            return Err(Error::frame(format!(
                "wrong series nibble {header:#04x}, expected {:#04x}",
                self.expected
            )));
        }
        self.expected = next_series(self.expected);
        self.data.extend_from_slice(&payload[1..8.min(payload.len())]);
        Ok(ReadStep::Continue)
    }

    /// The collected logical bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Decode a complete payload series in one go.
pub fn decode_series(payloads: &[[u8; 8]]) -> Result<Vec<u8>> {
    let mut decoder = SeriesDecoder::new();
    let mut done = false;
    for payload in payloads {
        if done {
            return Err(Error::frame("trailing frame after final"));
        }
        done = decoder.feed(payload)? == ReadStep::Done;
    }
    if !done {
        return Err(Error::frame("series truncated"));
    }
    Ok(decoder.into_data())
}

/// One outstanding D2 request: serialize, await the correlated
/// response, reassemble.
#[derive(Debug, Clone)]
pub struct D2Request {
    message: D2Message,
}

impl D2Request {
    /// Request from service bytes and parameters.
    pub fn new(ecu_id: u8, service: &[u8], params: &[u8]) -> Self {
        Self {
            message: D2Message::new(ecu_id, service, params),
        }
    }

    /// Request from a pre-built message.
    pub fn from_message(message: D2Message) -> Self {
        Self { message }
    }

    /// Send the request and reassemble the matching positive response.
    ///
    /// Acceptance per the wire contract: the response marker bit in
    /// `frame[4]`, the echoed ECU id at `frame[5]` and `service + 0x40`
    /// at `frame[6]`; the remaining request-id bytes are stripped from
    /// the first frame. Negative responses map to [`Error::D2`].
    pub fn process(&self, channel: &Channel, timeout_ms: u32) -> Result<Vec<u8>> {
        channel.send(&self.message, timeout_ms)?;
        let ecu_id = self.message.ecu_id();
        let request_id = self.message.request_id().to_vec();
        let rest_request = request_id.len().saturating_sub(1);
        let mut first = true;
        let mut in_series = false;
        let mut series = 0x09u8;
        let mut result = Vec::new();
        channel.read_with(timeout_ms, |frame| {
            let data = frame.raw();
            if first {
                if data.len() < 9 {
                    return Ok(ReadStep::Continue);
                }
                check_negative(ecu_id, &request_id, data)?;
                let mut offset = 7usize;
                if data.len() < offset + rest_request + 1 {
                    return Ok(ReadStep::Continue);
                }
                // Response marker bit first, then the echoed ECU id
                // and service + 0x40.
                let accept = data[4] & 0x80 != 0
                    && data[5] == ecu_id
                    && data[6] == request_id[0].wrapping_add(0x40);
                if !accept || !request_id[1..].iter().eq(data[offset..offset + rest_request].iter())
                {
                    trace!("skipping unrelated D2 frame {:02x?}", data);
                    return Ok(ReadStep::Continue);
                }
                in_series = data[4] & 0x40 == 0;
                first = false;
                offset += rest_request;
                result.extend_from_slice(&data[offset..]);
                return Ok(if in_series { ReadStep::Continue } else { ReadStep::Done });
            }
            if data.len() < 5 {
                return Ok(ReadStep::Continue);
            }
            let header = data[4];
            let mut end = data.len();
            if header & 0x40 != 0 {
                if header < 0x48 {
                    return Err(Error::frame("wrong data length in series"));
                }
                in_series = false;
                end = (5 + (header - 0x48) as usize).min(data.len());
            } else if header == series {
                series = next_series(series);
            } else {
                return Err(Error::frame(format!(
                    "wrong series index {header:#04x}, expected {series:#04x}"
                )));
            }
            result.extend_from_slice(&data[5..end]);
            Ok(if in_series { ReadStep::Continue } else { ReadStep::Done })
        })?;
        Ok(result)
    }
}

fn check_negative(ecu_id: u8, request_id: &[u8], data: &[u8]) -> Result<()> {
    if data.len() >= 9
        && data[4] == 0x8F
        && data[5] == ecu_id
        && data[6] == 0x7F
        && request_id.first() == Some(&data[7])
    {
        return Err(Error::D2(data[8]));
    }
    Ok(())
}

/// Canned messages used by the flasher, logger and CLI.
pub mod messages {
    use super::*;

    /// Broadcast that puts every module on the bus to sleep.
    pub fn go_to_sleep() -> D2Message {
        D2Message::raw(ECU_BROADCAST, &[0x86]).expect("static message")
    }

    /// Broadcast that wakes the bus back up.
    pub fn wake_up() -> D2Message {
        D2Message::raw(ECU_BROADCAST, &[0xC8]).expect("static message")
    }

    /// Wake one ECU.
    pub fn wake_up_ecu(ecu_id: u8) -> D2Message {
        D2Message::raw(ecu_id, &[0xC8]).expect("static message")
    }

    /// Start the primary bootloader.
    pub fn start_primary_bootloader(ecu_id: u8) -> D2Message {
        D2Message::raw(ecu_id, &[0xC0]).expect("static message")
    }

    /// Point the bootloader at a memory address.
    pub fn set_memory_addr(ecu_id: u8, addr: u32) -> D2Message {
        let a = be32(addr);
        D2Message::raw(ecu_id, &[0x9C, a[0], a[1], a[2], a[3]]).expect("static message")
    }

    /// Ask the bootloader for the additive checksum up to `end`.
    pub fn calculate_checksum(ecu_id: u8, end: u32) -> D2Message {
        let a = be32(end);
        D2Message::raw(ecu_id, &[0xB4, a[0], a[1], a[2], a[3]]).expect("static message")
    }

    /// Jump to the previously set address.
    pub fn jump_to(ecu_id: u8) -> D2Message {
        D2Message::raw(ecu_id, &[0xA0, 0, 0, 0, 0, 0, 0]).expect("static message")
    }

    /// Erase the flash sector at the previously set address.
    pub fn erase(ecu_id: u8) -> D2Message {
        D2Message::raw(ecu_id, &[0xF8]).expect("static message")
    }

    /// Mark the end of a bootloader data transfer.
    pub fn sbl_transfer_complete(ecu_id: u8) -> D2Message {
        D2Message::raw(ecu_id, &[0xA8]).expect("static message")
    }

    /// Read `size` bytes from a 24-bit address.
    pub fn read_memory_by_offset(ecu_id: u8, addr: u32, size: u8) -> D2Message {
        D2Message::new(
            ecu_id,
            &[0xA7],
            &[(addr >> 16) as u8, (addr >> 8) as u8, addr as u8, 1, size],
        )
    }

    /// Read `size` bytes from a 32-bit address.
    pub fn read_data_by_addr(ecu_id: u8, addr: u32, size: u8) -> D2Message {
        let a = be32(addr);
        D2Message::new(ecu_id, &[0xB4, 0x21, 0x34], &[a[0], a[1], a[2], a[3], size])
    }

    /// Clear stored DTCs.
    pub fn clear_dtc(ecu_id: u8) -> D2Message {
        D2Message::new(ecu_id, &[0xAF, 0x11], &[])
    }

    /// Register a memory address for periodic measurement.
    pub fn register_addr(addr: u32, size: usize) -> D2Message {
        D2Message::new(
            EcuKind::EcmMe as u8,
            &[0xAA, 0x50],
            &[(addr >> 16) as u8, (addr >> 8) as u8, addr as u8, size as u8],
        )
    }

    /// Drop all registered measurement addresses.
    pub fn unregister_all() -> D2Message {
        D2Message::new(EcuKind::EcmMe as u8, &[0xAA, 0x00], &[])
    }

    /// Request one record of all registered measurements.
    pub fn request_memory() -> D2Message {
        D2Message::new(EcuKind::EcmMe as u8, &[0xA6, 0xF0, 0x00, 0x01], &[])
    }

    /// Request the VIN from the CEM.
    pub fn request_vin() -> D2Message {
        D2Message::new(EcuKind::Cem as u8, &[0xB9, 0xFB], &[])
    }

    /// Request the vehicle configuration block from the CEM.
    pub fn request_vehicle_configuration() -> D2Message {
        D2Message::new(EcuKind::Cem as u8, &[0xB9, 0xFC], &[])
    }

    /// Set the dashboard clock.
    pub fn set_current_time(hours: u8, minutes: u8) -> D2Message {
        let value = u16::from(minutes) + u16::from(hours) * 60;
        D2Message::new(
            EcuKind::Dim as u8,
            &[0xB0, 0x07, 0x01, 0xFF],
            &[(value >> 8) as u8, value as u8],
        )
    }

    /// Render a flash image into write-data messages: 6 data bytes per
    /// payload behind `[ecu, 0xA8 + len]`, at most ten payloads per
    /// message, closed by a bare `0xA8` marker.
    pub fn write_data_msgs(ecu_id: u8, bin: &[u8]) -> Vec<D2Message> {
        const CHUNK: usize = 6;
        const MAX_PER_MSG: usize = 10;
        let mut result = Vec::new();
        let mut payloads: Vec<[u8; 8]> = Vec::new();
        for chunk in bin.chunks(CHUNK) {
            let mut payload = [0u8; 8];
            payload[0] = ecu_id;
            payload[1] = 0xA8 + chunk.len() as u8;
            payload[2..2 + chunk.len()].copy_from_slice(chunk);
            payloads.push(payload);
            if payloads.len() >= MAX_PER_MSG {
                result.push(D2Message::from_payloads(ecu_id, std::mem::take(&mut payloads)));
            }
        }
        let mut terminator = [0u8; 8];
        terminator[0] = ecu_id;
        terminator[1] = 0xA8;
        payloads.push(terminator);
        result.push(D2Message::from_payloads(ecu_id, payloads));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame_encode() {
        let m = D2Message::new(0x50, &[0xB9, 0xFB], &[]);
        assert_eq!(m.payloads().len(), 1);
        assert_eq!(m.payloads()[0], [0xCB, 0x50, 0xB9, 0xFB, 0, 0, 0, 0]);
    }

    #[test]
    fn multi_frame_encode_series_cycles() {
        // 1 + 2 + 14 = 17 logical bytes → frames of 7, 7, 3.
        let params: Vec<u8> = (0..14).collect();
        let m = D2Message::new(0x7A, &[0xAD, 0x01], &params);
        let p = m.payloads();
        assert_eq!(p.len(), 3);
        assert_eq!(p[0][0], 0x8F);
        assert_eq!(p[1][0], 0x09);
        assert_eq!(p[2][0], 0x48 + 3);
        // Long message: the series nibble must cycle 9..F then wrap to 8.
        let long: Vec<u8> = (0..70).collect();
        let m = D2Message::new(0x7A, &[0x30], &long);
        let headers: Vec<u8> = m.payloads().iter().map(|pl| pl[0]).collect();
        assert_eq!(headers[0], 0x8F);
        assert_eq!(
            &headers[1..headers.len() - 1],
            &[0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F, 0x08, 0x09]
        );
        assert_eq!(*headers.last().unwrap(), 0x48 + 2);
    }

    #[test]
    fn decode_rejects_wrong_series_nibble() {
        let mut frames = D2Message::new(0x7A, &[0xAD], &(0..20).collect::<Vec<u8>>())
            .payloads()
            .to_vec();
        frames[1][0] = 0x08; // expected 0x09
        assert!(matches!(decode_series(&frames), Err(Error::Frame(_))));
    }

    #[test]
    fn decode_three_frame_series() -> crate::Result<()> {
        let mut f1 = [0u8; 8];
        f1[0] = 0x8F;
        f1[1..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7]);
        let mut f2 = [0u8; 8];
        f2[0] = 0x09;
        f2[1..8].copy_from_slice(&[8, 9, 10, 11, 12, 13, 14]);
        let mut f3 = [0u8; 8];
        f3[0] = 0x4B;
        f3[1..4].copy_from_slice(&[15, 16, 17]);
        let data = decode_series(&[f1, f2, f3])?;
        assert_eq!(data, (1..=17).collect::<Vec<u8>>());
        Ok(())
    }

    #[test]
    fn roundtrip() -> crate::Result<()> {
        for len in [0usize, 1, 4, 6, 7, 8, 13, 14, 100, 1000, 4093] {
            let params: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let m = D2Message::new(0x6E, &[0xB4, 0x21], &params);
            let decoded = decode_series(m.payloads())?;
            let mut expected = vec![0x6E, 0xB4, 0x21];
            expected.extend_from_slice(&params);
            assert_eq!(decoded, expected, "len {len}");
        }
        Ok(())
    }

    #[test]
    fn final_frame_length_matches_remainder() {
        let params: Vec<u8> = (0..9).collect();
        // 1 + 1 + 9 = 11 logical bytes → 7 + 4.
        let m = D2Message::new(0x7A, &[0x30], &params);
        let last = m.payloads().last().unwrap();
        assert_eq!(last[0], 0x48 + 4);
    }

    #[test]
    fn raw_message_has_no_header() -> crate::Result<()> {
        let m = D2Message::raw(0x7A, &[0x9C, 0xDE, 0xAD, 0xBE, 0xEF])?;
        assert_eq!(m.payloads()[0], [0x7A, 0x9C, 0xDE, 0xAD, 0xBE, 0xEF, 0, 0]);
        assert!(D2Message::raw(0x7A, &[0; 8]).is_err());
        Ok(())
    }

    #[test]
    fn ecu_kind_magic_prefixes() {
        assert_eq!(ecu_kind_from_prefix(&[0x01, 0x20, 0x00, 0x05]), EcuKind::Tcm);
        assert_eq!(ecu_kind_from_prefix(&[0x01, 0x20, 0x00, 0x21]), EcuKind::EcmMe);
        assert_eq!(ecu_kind_from_prefix(&[0x00, 0x00, 0x00, 0x00]), EcuKind::Cem);
    }

    #[test]
    fn write_data_batches() {
        let bin: Vec<u8> = (0..100).collect();
        let msgs = messages::write_data_msgs(0x7A, &bin);
        // 17 data payloads split 10 + 7, terminator in the last batch.
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].payloads().len(), 10);
        assert_eq!(msgs[1].payloads().len(), 8);
        let last = msgs[1].payloads().last().unwrap();
        assert_eq!(&last[0..2], &[0x7A, 0xA8]);
        // 100 = 16 * 6 + 4: final data payload carries 4 bytes.
        let tail = msgs[1].payloads()[6];
        assert_eq!(tail[1], 0xA8 + 4);
    }
}

/*! TP 2.0 transport session (KWP 2000 over CAN).

A session is negotiated in two phases: a channel-setup exchange on the
broadcast id `0x200` that yields the data-channel CAN ids, then a
parameter negotiation (`0xA0`) that yields the send window and the
minimum inter-frame delay. After that, requests of up to 4096 bytes are
fragmented into 8-byte payloads with a 4-bit sequence nibble, sent
under a sliding ack window, and responses are reassembled the same way.

Frame opcodes (high nibble of the first payload byte):

* `0x1_`: data, acknowledgement required (end of block or message),
* `0x2_`: data, no acknowledgement required,
* `0xB_`: acknowledgement,
* `0xA1`: connection test / parameter response (ignored mid-exchange),
* `0xA3`: keep-alive,
* `0xA0`: parameter negotiation,
* `0xA8`: disconnect.
*/
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::adapter::{CanFrame, Channel, PeriodicId, ReadStep};
use crate::config::{self, CarPlatform};
use crate::{Error, Result};

/// Broadcast id every channel-setup exchange starts on.
pub const SETUP_CAN_ID: u32 = 0x200;
/// The rx channel id we ask the ECU to talk to us on.
pub const REQUESTED_RX_ID: u16 = 0x300;
/// Largest request one session exchange can carry.
pub const MAX_REQUEST: usize = 4096;

/// Channel-setup opcode.
pub const OP_CHANNEL_SETUP: u8 = 0x20;
/// Channel-setup positive response opcode.
pub const OP_CHANNEL_SETUP_OK: u8 = 0xD0;
/// Parameter-negotiation opcode.
pub const OP_PARAMS: u8 = 0xA0;
/// Parameter-negotiation positive response / connection test.
pub const OP_PARAMS_OK: u8 = 0xA1;
/// Keep-alive opcode.
pub const OP_ALIVE: u8 = 0xA3;
/// Disconnect opcode.
pub const OP_DISCONNECT: u8 = 0xA8;

/// Fixed description for a KWP negative-response code seen over TP 2.0.
pub fn nrc_description(code: u8) -> &'static str {
    match code {
        0x10 => "Generic error",
        0x11 => "Service not supported",
        0x12 => "Sub function not supported",
        0x13 => "Invalid message length/format",
        0x21 => "Busy, repeat request",
        0x22 => "Conditions not correct",
        0x23 => "Routine not complete or service in progress",
        0x24 => "Request sequence error",
        0x31 => "Request out of range",
        0x33 => "Security access denied",
        0x35 => "Invalid key",
        0x36 => "Exceeded number of attempts",
        0x37 => "Required time delay has not expired",
        0x41 => "Improper download type",
        0x42 => "Can not download to specified address",
        0x43 => "Can not download number of bytes requested",
        0x50 => "Upload not accepted",
        0x51 => "Improper upload type",
        0x52 => "Can not upload from specified address",
        0x53 => "Can not upload number of bytes requested",
        0x71 => "Transfer data suspended",
        0x72 => "Transfer aborted",
        0x74 => "Illegal address in block transfer",
        0x75 => "Illegal byte count in block transfer",
        0x76 => "Illegal block transfer type",
        0x77 => "Block transfer data checksum error",
        0x78 => "Busy, response pending",
        0x79 => "Incorrect byte count during block transfer",
        0x7E => "Sub function not supported in active session",
        0x7F => "Service or subfunction not supported",
        0x80 => "Service not supported in active session",
        0x90 => "No program",
        _ => "Unknown negative response",
    }
}

/// Decode the negotiated minimum send delay: the upper two bits select
/// the unit (×0.1 ms, ×1 ms, ×10 ms, ×100 ms), the lower six the value.
pub fn decode_min_delay(raw: u8) -> Duration {
    let value = u64::from(raw & 0x3F);
    match raw >> 6 {
        0 => Duration::from_micros(value * 100),
        1 => Duration::from_millis(value),
        2 => Duration::from_millis(value * 10),
        _ => Duration::from_millis(value * 100),
    }
}

/// Split a request into TP 2.0 payloads (opcode byte left blank).
///
/// The first payload carries the 16-bit length and five data bytes,
/// every following payload seven.
pub fn fragment(request: &[u8]) -> Result<VecDeque<Vec<u8>>> {
    if request.len() > MAX_REQUEST {
        return Err(Error::invalid(format!(
            "TP 2.0 request of {} bytes exceeds {MAX_REQUEST}",
            request.len()
        )));
    }
    let mut queue = VecDeque::new();
    let mut payload = vec![0u8, (request.len() >> 8) as u8, request.len() as u8];
    let mut room = 8 - payload.len();
    let mut offset = 0usize;
    loop {
        let take = room.min(request.len() - offset);
        payload.extend_from_slice(&request[offset..offset + take]);
        queue.push_back(payload);
        offset += take;
        if offset >= request.len() {
            return Ok(queue);
        }
        payload = vec![0u8];
        room = 7;
    }
}

/// Exchange state for one outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exchange {
    SendRequest,
    WaitAck,
    ReadResponse,
    WriteAck,
    Idle,
}

/// One TP 2.0 session on a raw CAN channel.
pub struct Tp20Session<'a> {
    channel: &'a Channel,
    platform: CarPlatform,
    ecu_id: u8,
    rx_id: u32,
    tx_id: u32,
    min_send_delay: Duration,
    max_pkts_till_ack: u8,
    pkts_till_ack: u8,
    send_seq: u8,
    ack_seq: u8,
    last_send: Option<Instant>,
    send_queue: VecDeque<Vec<u8>>,
    recv_buf: Vec<u8>,
    need_read_more: bool,
    need_send_ack: bool,
    need_read_ack: bool,
    keepalive: Option<PeriodicId>,
}

impl<'a> Tp20Session<'a> {
    /// Create an unconnected session for an ECU on a platform.
    pub fn new(channel: &'a Channel, platform: CarPlatform, ecu_id: u8) -> Self {
        Self {
            channel,
            platform,
            ecu_id,
            rx_id: 0,
            tx_id: 0,
            min_send_delay: Duration::ZERO,
            max_pkts_till_ack: 0,
            pkts_till_ack: 0,
            send_seq: 0,
            ack_seq: 0,
            last_send: None,
            send_queue: VecDeque::new(),
            recv_buf: Vec::new(),
            need_read_more: false,
            need_send_ack: false,
            need_read_ack: false,
            keepalive: None,
        }
    }

    /// Negotiated send window size.
    pub fn max_pkts_till_ack(&self) -> u8 {
        self.max_pkts_till_ack
    }

    /// Negotiated minimum inter-frame delay.
    pub fn min_send_delay(&self) -> Duration {
        self.min_send_delay
    }

    /// Run the channel-setup handshake and parameter negotiation, then
    /// start the 1000 ms keep-alive.
    pub fn start(&mut self) -> Result<()> {
        let (_, ecu) = config::ecu_info(self.platform, self.ecu_id)?;
        let setup = [
            self.ecu_id,
            OP_CHANNEL_SETUP,
            0x00,
            0x10,
            (REQUESTED_RX_ID & 0xFF) as u8,
            (REQUESTED_RX_ID >> 8) as u8,
            0x01,
        ];
        let resp = exchange(self.channel, SETUP_CAN_ID, ecu.can_id, &setup, 1000)?;
        if resp.len() < 6
            || resp[0] != 0
            || resp[1] != OP_CHANNEL_SETUP_OK
            || u16::from(resp[2]) | (u16::from(resp[3]) << 8) != REQUESTED_RX_ID
        {
            return Err(Error::frame("channel setup rejected"));
        }
        let tx_id = u32::from(resp[4]) | (u32::from(resp[5]) << 8);
        config::prepare_tp20_channel(self.channel, u32::from(REQUESTED_RX_ID))?;

        let params = [OP_PARAMS, 0x0F, 0x8A, 0xFF, 0x32, 0xFF];
        let resp = exchange(self.channel, tx_id, u32::from(REQUESTED_RX_ID), &params, 2000)?;
        if resp.len() < 6 || resp[0] != OP_PARAMS_OK {
            return Err(Error::frame("parameter negotiation rejected"));
        }
        self.tx_id = tx_id;
        self.rx_id = u32::from(REQUESTED_RX_ID);
        self.max_pkts_till_ack = resp[1];
        self.pkts_till_ack = resp[1];
        self.min_send_delay = decode_min_delay(resp[4]);
        self.send_seq = 0;
        self.ack_seq = 0;
        debug!(
            "TP 2.0 session up: tx {:#x}, window {}, min delay {:?}",
            self.tx_id, self.max_pkts_till_ack, self.min_send_delay
        );
        self.keepalive = Some(
            self.channel
                .start_periodic(&CanFrame::new(self.tx_id, &[OP_ALIVE]), 1000)?,
        );
        Ok(())
    }

    /// Send the disconnect opcode and stop the keep-alive.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(id) = self.keepalive.take() {
            self.channel.stop_periodic(id)?;
        }
        if self.tx_id != 0 {
            self.channel
                .write(&[CanFrame::new(self.tx_id, &[OP_DISCONNECT])], 1000)?;
            self.tx_id = 0;
        }
        Ok(())
    }

    /// Run one request/response exchange through the session.
    pub fn process(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        self.send_queue = fragment(request)?;
        self.recv_buf.clear();
        self.need_read_more = false;
        self.need_send_ack = false;
        self.need_read_ack = false;
        let mut state = Exchange::SendRequest;
        while state != Exchange::Idle {
            state = match state {
                Exchange::SendRequest => {
                    self.send_next()?;
                    if self.need_read_ack {
                        Exchange::WaitAck
                    } else if self.send_queue.is_empty() {
                        Exchange::ReadResponse
                    } else {
                        Exchange::SendRequest
                    }
                }
                Exchange::WaitAck => {
                    self.read_ack()?;
                    if !self.send_queue.is_empty() {
                        Exchange::SendRequest
                    } else {
                        Exchange::ReadResponse
                    }
                }
                Exchange::ReadResponse => {
                    self.read_response()?;
                    if self.need_send_ack {
                        Exchange::WriteAck
                    } else if !self.need_read_more {
                        Exchange::Idle
                    } else {
                        Exchange::ReadResponse
                    }
                }
                Exchange::WriteAck => {
                    self.send_ack()?;
                    if self.need_read_more {
                        Exchange::ReadResponse
                    } else {
                        Exchange::Idle
                    }
                }
                Exchange::Idle => unreachable!(),
            };
        }
        Ok(std::mem::take(&mut self.recv_buf))
    }

    fn send_next(&mut self) -> Result<()> {
        let mut payload = self
            .send_queue
            .pop_front()
            .ok_or_else(|| Error::invalid("nothing queued to send"))?;
        let last = self.send_queue.is_empty();
        let window_closing = self.pkts_till_ack <= 1;
        payload[0] = if last || window_closing { 0x10 } else { 0x20 };
        let seq = self.send_seq;
        self.send_seq = (self.send_seq + 1) & 0x0F;
        self.send_frame(seq, payload)?;
        self.pkts_till_ack = self.pkts_till_ack.saturating_sub(1);
        self.need_read_ack = self.pkts_till_ack == 0 || last;
        Ok(())
    }

    fn send_frame(&mut self, seq: u8, mut payload: Vec<u8>) -> Result<()> {
        if let Some(last) = self.last_send {
            let next_allowed = last + self.min_send_delay;
            let now = Instant::now();
            if next_allowed > now {
                std::thread::sleep(next_allowed - now);
            }
        }
        payload[0] |= seq & 0x0F;
        trace!("tp20 tx seq {seq}: {payload:02x?}");
        self.channel
            .write(&[CanFrame::new(self.tx_id, &payload)], 5000)?;
        self.last_send = Some(Instant::now());
        Ok(())
    }

    fn read_ack(&mut self) -> Result<()> {
        let rx_id = self.rx_id;
        let mut acked = false;
        self.channel.read_with(5000, |frame| {
            if skip_frame(rx_id, frame) {
                return Ok(ReadStep::Continue);
            }
            if frame.payload()[0] & 0xF0 == 0xB0 {
                acked = true;
                return Ok(ReadStep::Done);
            }
            Ok(ReadStep::Continue)
        })?;
        if acked {
            self.need_read_ack = false;
            self.pkts_till_ack = self.max_pkts_till_ack;
        }
        Ok(())
    }

    fn read_response(&mut self) -> Result<()> {
        let rx_id = self.rx_id;
        let mut need_read_more = false;
        let mut need_send_ack = false;
        let mut ack_seq = 0u8;
        let mut received = Vec::new();
        self.channel.read_with(5000, |frame| {
            if skip_frame(rx_id, frame) {
                return Ok(ReadStep::Continue);
            }
            let header = frame.payload()[0];
            let op = (header >> 4) & 0x0F;
            need_read_more = op & 0x1 == 0;
            need_send_ack = op & 0x2 == 0;
            received.extend_from_slice(&frame.payload()[1..]);
            if need_send_ack {
                ack_seq = (header & 0x0F).wrapping_add(1) & 0x0F;
            }
            Ok(if need_read_more && !need_send_ack {
                ReadStep::Continue
            } else {
                ReadStep::Done
            })
        })?;
        self.need_read_more = need_read_more;
        self.need_send_ack = need_send_ack;
        if need_send_ack {
            self.ack_seq = ack_seq;
        }
        self.recv_buf.extend_from_slice(&received);
        Ok(())
    }

    fn send_ack(&mut self) -> Result<()> {
        let seq = self.ack_seq;
        self.send_frame(seq, vec![0xB0])?;
        self.need_send_ack = false;
        Ok(())
    }
}

impl Drop for Tp20Session<'_> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Frames that are not part of the current exchange: wrong rx id, short
/// payload, or the `0xA1` connection test.
fn skip_frame(rx_id: u32, frame: &CanFrame) -> bool {
    frame.payload().is_empty() || frame.can_id() != rx_id || frame.payload()[0] == OP_PARAMS_OK
}

/// One raw control-channel exchange (setup, parameter negotiation):
/// send a payload, await the first frame from `response_id`, return its
/// payload bytes.
fn exchange(
    channel: &Channel,
    can_id: u32,
    response_id: u32,
    payload: &[u8],
    timeout_ms: u32,
) -> Result<Vec<u8>> {
    channel.write(&[CanFrame::new(can_id, payload)], timeout_ms)?;
    let mut result = Vec::new();
    channel.read_with(timeout_ms, |frame| {
        if frame.can_id() != response_id {
            return Ok(ReadStep::Continue);
        }
        result.extend_from_slice(frame.payload());
        Ok(ReadStep::Done)
    })?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_delay_units() {
        assert_eq!(decode_min_delay(0x32), Duration::from_micros(5000));
        assert_eq!(decode_min_delay(0x40 | 50), Duration::from_millis(50));
        assert_eq!(decode_min_delay(0x80 | 5), Duration::from_millis(50));
        assert_eq!(decode_min_delay(0xC0 | 2), Duration::from_millis(200));
    }

    #[test]
    fn fragment_layout() -> crate::Result<()> {
        // 5 data bytes fit behind the length header, 7 per payload after.
        let request: Vec<u8> = (0..19).collect();
        let q = fragment(&request)?;
        assert_eq!(q.len(), 3);
        assert_eq!(q[0], vec![0, 0, 19, 0, 1, 2, 3, 4]);
        assert_eq!(q[1], vec![0, 5, 6, 7, 8, 9, 10, 11]);
        assert_eq!(q[2], vec![0, 12, 13, 14, 15, 16, 17, 18]);
        assert_eq!(fragment(&(0..20).collect::<Vec<u8>>())?.len(), 4);
        Ok(())
    }

    #[test]
    fn fragment_totals() -> crate::Result<()> {
        for len in [0usize, 1, 5, 6, 12, 13, 100, 4096] {
            let request: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let q = fragment(&request)?;
            let total: usize = q.iter().map(|p| p.len() - 1).sum::<usize>() - 2;
            assert_eq!(total, len, "len {len}");
            assert!(q.iter().all(|p| p.len() <= 8));
            // Length header is big-endian.
            assert_eq!(q[0][1], (len >> 8) as u8);
            assert_eq!(q[0][2], len as u8);
        }
        assert!(fragment(&vec![0u8; MAX_REQUEST + 1]).is_err());
        Ok(())
    }

    #[test]
    fn kwp_nrc_strings() {
        assert_eq!(nrc_description(0x90), "No program");
        assert_eq!(nrc_description(0x77), "Block transfer data checksum error");
    }
}

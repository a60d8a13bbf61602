/*! UDS (ISO 14229) requests and the negative-response table.

A response arrives as one reassembled adapter message: four bytes of
responder CAN id, then the service byte. `request + 0x40` is the
positive response; `0x7F, request, nrc` is a negative one. NRC `0x78`
("response pending") is absorbed by the read loop; the ECU is asking
for patience, not reporting failure.
*/
use log::trace;

use crate::adapter::{Channel, ReadStep};
use crate::isotp::UdsMessage;
use crate::{Error, Result};

/// Request received, response pending. Absorbed by the read loop.
pub const NRC_RESPONSE_PENDING: u8 = 0x78;
/// Required time delay has not expired. Authorize retries on this.
pub const NRC_TIME_DELAY: u8 = 0x37;

/// Service ids used in this crate.
#[allow(missing_docs)]
pub mod service {
    pub const START_DIAGNOSTIC_SESSION: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DATA_BY_IDENTIFIER: u8 = 0x22;
    pub const READ_MEMORY_BY_ADDRESS: u8 = 0x23;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const DYNAMICALLY_DEFINE_DATA_IDENTIFIER: u8 = 0x2C;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// Fixed description for a UDS negative-response code.
pub fn nrc_description(code: u8) -> &'static str {
    match code {
        0x10 => "General reject",
        0x11 => "Service not supported",
        0x12 => "Sub function not supported",
        0x13 => "Invalid message length/format",
        0x14 => "Response too long",
        0x21 => "Busy, repeat request",
        0x22 => "Conditions not correct",
        0x24 => "Request sequence error",
        0x25 => "No response from subnet component",
        0x26 => "Failure prevents execution of requested action",
        0x31 => "Request out of range",
        0x33 => "Security access denied",
        0x35 => "Invalid key",
        0x36 => "Exceeded number of attempts",
        0x37 => "Required time delay has not expired",
        0x70 => "Upload/download not accepted",
        0x71 => "Transfer data suspended",
        0x72 => "General programming failure",
        0x73 => "Wrong block sequence counter",
        0x78 => "Request received, response pending",
        0x7E => "Sub function not supported in active session",
        0x7F => "Service not supported in active session",
        0x81 => "RPM too high",
        0x82 => "RPM too low",
        0x83 => "Engine is running",
        0x84 => "Engine is not running",
        0x85 => "Engine run time too low",
        0x86 => "Temperature too high",
        0x87 => "Temperature too low",
        0x88 => "Speed too high",
        0x89 => "Speed too low",
        0x8A => "Throttle pedal too high",
        0x8B => "Throttle pedal too low",
        0x8C => "Transmission range not in neutral",
        0x8D => "Transmission range not in gear",
        0x8F => "Brake switches not closed",
        0x90 => "Shifter lever not in park",
        0x91 => "Torque converter clutch locked",
        0x92 => "Voltage too high",
        0x93 => "Voltage too low",
        _ => "Unknown negative response",
    }
}

/// Raise [`Error::Uds`] if `data` is a negative response to `request_id`.
fn check_negative(request_id: u8, data: &[u8]) -> Result<()> {
    if data.len() >= 7 && data[4] == service::NEGATIVE_RESPONSE && data[5] == request_id {
        return Err(Error::Uds(data[6]));
    }
    Ok(())
}

/// One outstanding UDS request.
#[derive(Debug, Clone)]
pub struct UdsRequest {
    request_id: u8,
    message: UdsMessage,
}

impl UdsRequest {
    /// Build a request; the first data byte is the service id used for
    /// response correlation.
    pub fn new(can_id: u32, data: Vec<u8>) -> Result<Self> {
        let request_id = *data
            .first()
            .ok_or_else(|| Error::invalid("empty UDS request"))?;
        Ok(Self {
            request_id,
            message: UdsMessage::new(can_id, data),
        })
    }

    /// Send the request and await the positive response. Returns the
    /// full response bytes, responder id prefix included.
    ///
    /// `0x7F ... 0x78` re-arms the read with the same timeout; every
    /// other negative response becomes [`Error::Uds`].
    pub fn process(&self, channel: &Channel, timeout_ms: u32) -> Result<Vec<u8>> {
        channel.send(&self.message, timeout_ms)?;
        let mut result = Vec::new();
        channel.read_with(timeout_ms, |frame| {
            let data = frame.raw();
            match check_negative(self.request_id, data) {
                Err(Error::Uds(NRC_RESPONSE_PENDING)) => {
                    trace!("response pending, re-arming read");
                    return Ok(ReadStep::Continue);
                }
                other => other?,
            }
            if data.len() < 5 || data[4] != self.request_id.wrapping_add(0x40) {
                return Ok(ReadStep::Continue);
            }
            result.extend_from_slice(data);
            Ok(ReadStep::Done)
        })?;
        Ok(result)
    }

    /// Send the request and await a positive response whose bytes after
    /// the service echo start with `check`. Mismatching positive
    /// responses consume `retries`; on success the bytes *after* the
    /// checked prefix are returned.
    pub fn process_expect(
        &self,
        channel: &Channel,
        check: &[u8],
        mut retries: usize,
        timeout_ms: u32,
    ) -> Result<Vec<u8>> {
        channel.clear_rx()?;
        channel.send(&self.message, timeout_ms)?;
        let mut result = Vec::new();
        channel.read_with(timeout_ms, |frame| {
            let data = frame.raw();
            match check_negative(self.request_id, data) {
                Err(Error::Uds(NRC_RESPONSE_PENDING)) => return Ok(ReadStep::Continue),
                other => other?,
            }
            let mut offset = 4usize;
            if data.len() < offset + 1 + check.len() {
                return Ok(ReadStep::Continue);
            }
            if data[offset] != self.request_id.wrapping_add(0x40) {
                return Ok(ReadStep::Continue);
            }
            offset += 1;
            if !check.iter().eq(data[offset..offset + check.len()].iter()) {
                retries = retries.saturating_sub(1);
                if retries == 0 {
                    return Err(Error::flash("expected acknowledgement never arrived"));
                }
                return Ok(ReadStep::Continue);
            }
            offset += check.len();
            result.extend_from_slice(&data[offset..]);
            Ok(ReadStep::Done)
        })?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_response_maps_to_error() {
        let data = [0x00, 0x00, 0x07, 0xE8, 0x7F, 0x22, 0x31];
        assert_eq!(check_negative(0x22, &data), Err(Error::Uds(0x31)));
        // A 0x7F answering some other service is not ours.
        assert_eq!(check_negative(0x27, &data), Ok(()));
    }

    #[test]
    fn nrc_strings() {
        assert_eq!(nrc_description(0x35), "Invalid key");
        assert_eq!(nrc_description(0x78), "Request received, response pending");
        assert_eq!(nrc_description(0xEE), "Unknown negative response");
    }

    #[test]
    fn request_requires_service_byte() {
        assert!(UdsRequest::new(0x7E0, vec![]).is_err());
        assert!(UdsRequest::new(0x7E0, vec![0x3E, 0x80]).is_ok());
    }
}

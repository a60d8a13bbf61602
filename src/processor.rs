/*! The request-processor seam shared by the flasher, PIN scanner and
logger: `process(service, params, timeout) → response bytes`, with the
per-protocol framing, correlation and negative-response mapping hidden
behind it.
*/
use crate::adapter::Channel;
use crate::d2::D2Request;
use crate::tp20::Tp20Session;
use crate::uds::UdsRequest;
use crate::{Error, Result};

/// A protocol endpoint that can run one request/response exchange.
pub trait RequestProcessor {
    /// Send `service ++ params` and return the positive-response
    /// payload.
    fn process(&mut self, service: &[u8], params: &[u8], timeout_ms: u32) -> Result<Vec<u8>>;

    /// (Re-)establish the underlying transport, where there is one.
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Tear the underlying transport down, where there is one.
    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

/// UDS over an ISO-TP channel.
pub struct UdsProcessor<'a> {
    channel: &'a Channel,
    can_id: u32,
}

impl<'a> UdsProcessor<'a> {
    /// Processor for one ECU CAN id.
    pub fn new(channel: &'a Channel, can_id: u32) -> Self {
        Self { channel, can_id }
    }
}

impl RequestProcessor for UdsProcessor<'_> {
    fn process(&mut self, service: &[u8], params: &[u8], timeout_ms: u32) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(service.len() + params.len());
        data.extend_from_slice(service);
        data.extend_from_slice(params);
        UdsRequest::new(self.can_id, data)?.process(self.channel, timeout_ms)
    }
}

/// D2 over a raw CAN channel.
pub struct D2Processor<'a> {
    channel: &'a Channel,
    ecu_id: u8,
}

impl<'a> D2Processor<'a> {
    /// Processor for one D2 ECU id.
    pub fn new(channel: &'a Channel, ecu_id: u8) -> Self {
        Self { channel, ecu_id }
    }
}

impl RequestProcessor for D2Processor<'_> {
    fn process(&mut self, service: &[u8], params: &[u8], timeout_ms: u32) -> Result<Vec<u8>> {
        D2Request::new(self.ecu_id, service, params).process(self.channel, timeout_ms)
    }
}

/// KWP 2000 over a TP 2.0 session. Fragmentation, windowing and
/// reassembly are the session's business; this processor validates the
/// length prefix and maps negative responses.
pub struct Tp20Processor<'a, 'c> {
    session: &'a mut Tp20Session<'c>,
}

impl<'a, 'c> Tp20Processor<'a, 'c> {
    /// Processor over an established (or establishable) session.
    pub fn new(session: &'a mut Tp20Session<'c>) -> Self {
        Self { session }
    }
}

impl RequestProcessor for Tp20Processor<'_, '_> {
    fn process(&mut self, service: &[u8], params: &[u8], _timeout_ms: u32) -> Result<Vec<u8>> {
        let mut request = Vec::with_capacity(service.len() + params.len());
        request.extend_from_slice(service);
        request.extend_from_slice(params);
        let response = self.session.process(&request)?;
        if response.len() < 2 {
            return Err(Error::frame("TP 2.0 response missing length prefix"));
        }
        let declared = usize::from(response[0]) << 8 | usize::from(response[1]);
        let payload = &response[2..];
        if payload.len() < declared {
            return Err(Error::frame(format!(
                "TP 2.0 response truncated: {} of {declared} bytes",
                payload.len()
            )));
        }
        let payload = &payload[..declared];
        if payload.len() >= 3 && payload[0] == 0x7F {
            return Err(Error::Tp20(payload[2]));
        }
        Ok(payload.to_vec())
    }

    fn connect(&mut self) -> Result<()> {
        self.session.start()
    }

    fn disconnect(&mut self) -> Result<()> {
        self.session.stop()
    }
}

/*! Pass-through adapter facade.

The vendor driver (a J2534 DLL, SocketCAN shim, ...) lives behind the
[`PassThru`] trait. Everything above it only sees the typed wrappers in
this module: a [`Device`] owning the driver handle and [`Channel`]s
owning one protocol connection each.

A channel remembers the periodic messages and filters it started and
stops them on drop, so a flasher or logger can never leak a periodic
emitter on an error path.
*/
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::{Error, Result};

/// Largest message the adapter will carry: 4-byte id prefix plus 4124
/// payload bytes (one full ISO-TP transfer).
pub const MAX_MSG_LEN: usize = 4128;

/// Error codes reported by the pass-through driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    /// The requested operation did not complete in time.
    #[error("timeout")]
    Timeout,
    /// Receive buffer empty.
    #[error("buffer empty")]
    BufferEmpty,
    /// Transmit buffer full.
    #[error("buffer full")]
    BufferFull,
    /// Malformed message handed to the driver.
    #[error("invalid message")]
    InvalidMsg,
    /// The driver does not support the operation.
    #[error("not supported")]
    NotSupported,
    /// No device connected.
    #[error("device not connected")]
    DeviceNotConnected,
    /// Catch-all driver failure.
    #[error("driver failure")]
    Failed,
}

/// Wire protocol selected when connecting a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Raw CAN.
    Can,
    /// Raw CAN on the programmable-pin connector.
    CanPs,
    /// Vendor low-speed CAN variant with XON/XOFF flow gating.
    CanXonXoff,
    /// ISO 15765 (ISO-TP) with driver-side flow control.
    IsoTp,
    /// ISO 9141 K-line.
    Iso9141,
}

/// Connect flag: 29-bit CAN identifiers.
pub const FLAG_CAN_29BIT_ID: u32 = 0x0100;
/// Connect flag: accept both 11- and 29-bit identifiers.
pub const FLAG_CAN_ID_BOTH: u32 = 0x0800;
/// Connect flag: request the physical (non-multiplexed) channel.
pub const FLAG_PHYSICAL_CHANNEL: u32 = 0x8000;
/// Connect flag: K-line only, no L-line.
pub const FLAG_ISO9141_K_LINE_ONLY: u32 = 0x1000;
/// TX flag: pad ISO-TP frames to 8 bytes.
pub const TXFLAG_ISO15765_FRAME_PAD: u32 = 0x0040;

/// Channel configuration knobs for [`Channel::set_config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigParam {
    /// Bus data rate in bits per second.
    DataRate,
    /// Echo own transmissions (0 = off).
    Loopback,
    /// CAN bit sample point in percent.
    BitSamplePoint,
    /// J1962 connector pin selection.
    J1962Pins,
    /// UART parity for K-line channels.
    Parity,
    /// K-line W0 timing.
    W0,
    /// K-line W1 timing.
    W1,
    /// K-line P4 minimum inter-byte time.
    P4Min,
    /// Enable/disable the vendor XON/XOFF gating.
    CanXonXoff,
}

/// Message filter kinds for [`Channel::set_filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Let matching messages through.
    Pass,
    /// Drop matching messages.
    Block,
    /// ISO-TP flow-control filter.
    FlowControl,
}

/// Driver-side ioctl requests that are not plain config writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ioctl {
    /// Drop everything in the receive buffer.
    ClearRxBuffer,
    /// Drop everything in the transmit buffer.
    ClearTxBuffer,
    /// Install the vendor XON/XOFF filter table.
    XonXoffFilter(Vec<CanFrame>),
    /// Activate the previously installed XON/XOFF filter.
    XonXoffFilterActive,
}

/// One adapter message: a 4-byte big-endian CAN identifier prefix
/// followed by the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    data: Vec<u8>,
}

impl CanFrame {
    /// Build a frame from a CAN id and payload bytes.
    pub fn new(can_id: u32, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(4 + payload.len());
        data.extend_from_slice(&can_id.to_be_bytes());
        data.extend_from_slice(payload);
        assert!(data.len() <= MAX_MSG_LEN);
        Self { data }
    }

    /// Reconstruct a frame from raw driver bytes (id prefix included).
    pub fn from_raw(data: Vec<u8>) -> Result<Self> {
        if data.len() < 4 || data.len() > MAX_MSG_LEN {
            return Err(Error::frame(format!("bad frame length {}", data.len())));
        }
        Ok(Self { data })
    }

    /// CAN identifier from the 4-byte prefix.
    pub fn can_id(&self) -> u32 {
        u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    /// Payload after the id prefix.
    pub fn payload(&self) -> &[u8] {
        &self.data[4..]
    }

    /// Full wire bytes, id prefix included.
    pub fn raw(&self) -> &[u8] {
        &self.data
    }
}

/// Wire message: a logical request rendered as one or more frames.
pub trait Message {
    /// Frames to hand to the driver, in send order.
    fn to_frames(&self) -> Vec<CanFrame>;
}

impl Message for CanFrame {
    fn to_frames(&self) -> Vec<CanFrame> {
        vec![self.clone()]
    }
}

/// Result of one decoder-callback invocation during a response read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStep {
    /// Keep reading frames.
    Continue,
    /// The response is complete.
    Done,
}

/// Opaque periodic-message handle.
pub type PeriodicId = u32;
/// Opaque filter handle.
pub type FilterId = u32;
/// Driver channel handle.
pub type ChannelId = u32;

/// The pass-through driver boundary. Implementations wrap a vendor API
/// (or, in tests, a scripted stub).
pub trait PassThru: Send + Sync {
    /// Connect a protocol channel.
    fn connect(&self, protocol: Protocol, flags: u32, baudrate: u32)
    -> Result<ChannelId, AdapterError>;
    /// Tear a channel down.
    fn disconnect(&self, channel: ChannelId) -> Result<(), AdapterError>;
    /// Read up to `max` pending messages. An idle bus yields `Ok` with
    /// an empty vector, not a timeout.
    fn read_msgs(
        &self,
        channel: ChannelId,
        max: usize,
        timeout_ms: u32,
    ) -> Result<Vec<CanFrame>, AdapterError>;
    /// Write messages; returns how many were accepted.
    fn write_msgs(
        &self,
        channel: ChannelId,
        frames: &[CanFrame],
        timeout_ms: u32,
    ) -> Result<usize, AdapterError>;
    /// Start a driver-owned periodic transmission.
    fn start_periodic(
        &self,
        channel: ChannelId,
        frame: &CanFrame,
        interval_ms: u32,
    ) -> Result<PeriodicId, AdapterError>;
    /// Stop a periodic transmission.
    fn stop_periodic(&self, channel: ChannelId, id: PeriodicId) -> Result<(), AdapterError>;
    /// Install a message filter.
    fn start_filter(
        &self,
        channel: ChannelId,
        kind: FilterKind,
        mask: &CanFrame,
        pattern: &CanFrame,
        flow: Option<&CanFrame>,
    ) -> Result<FilterId, AdapterError>;
    /// Remove a message filter.
    fn stop_filter(&self, channel: ChannelId, id: FilterId) -> Result<(), AdapterError>;
    /// Driver ioctl.
    fn ioctl(&self, channel: ChannelId, request: &Ioctl) -> Result<(), AdapterError>;
    /// Write configuration parameters.
    fn set_config(
        &self,
        channel: ChannelId,
        params: &[(ConfigParam, u32)],
    ) -> Result<(), AdapterError>;
}

/// One opened pass-through device.
#[derive(Clone)]
pub struct Device {
    driver: Arc<dyn PassThru>,
    name: String,
}

impl Device {
    /// Open a device over a driver implementation.
    pub fn open(name: &str, driver: Arc<dyn PassThru>) -> Self {
        debug!("opened pass-through device {name}");
        Self {
            driver,
            name: name.to_string(),
        }
    }

    /// Device name as given to [`Device::open`].
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connect a channel on this device.
    pub fn connect(&self, protocol: Protocol, flags: u32, baudrate: u32) -> Result<Channel> {
        let id = self.driver.connect(protocol, flags, baudrate)?;
        debug!("connected channel {id} proto {protocol:?} flags {flags:#x} baud {baudrate}");
        Ok(Channel {
            driver: Arc::clone(&self.driver),
            id,
            protocol,
            tx_flags: 0,
            periodic: Mutex::new(Vec::new()),
            filters: Mutex::new(Vec::new()),
        })
    }
}

/// One connected protocol channel. Exclusive owner of its driver handle;
/// dropping the channel stops outstanding periodic messages and filters
/// and disconnects.
pub struct Channel {
    driver: Arc<dyn PassThru>,
    id: ChannelId,
    protocol: Protocol,
    tx_flags: u32,
    periodic: Mutex<Vec<PeriodicId>>,
    filters: Mutex<Vec<FilterId>>,
}

impl Channel {
    /// Protocol this channel was connected with.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// TX flags applied to outgoing messages.
    pub fn tx_flags(&self) -> u32 {
        self.tx_flags
    }

    /// Set the TX flags applied to outgoing messages.
    pub fn set_tx_flags(&mut self, flags: u32) {
        self.tx_flags = flags;
    }

    /// Read pending messages. Returns an empty vector when the bus is
    /// idle; a hard [`AdapterError::Timeout`] is an error.
    pub fn read(&self, max: usize, timeout_ms: u32) -> Result<Vec<CanFrame>> {
        Ok(self.driver.read_msgs(self.id, max, timeout_ms)?)
    }

    /// Read frames until the decoder callback reports
    /// [`ReadStep::Done`], enforcing `timeout_ms` over the whole read.
    ///
    /// The callback sees every received frame and may fail the read
    /// with a typed error (negative response, bad series nibble, ...).
    pub fn read_with<F>(&self, timeout_ms: u32, mut decode: F) -> Result<()>
    where
        F: FnMut(&CanFrame) -> Result<ReadStep>,
    {
        let deadline = Instant::now() + Duration::from_millis(u64::from(timeout_ms));
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            let remaining = deadline.duration_since(now).as_millis() as u32;
            let frames = self.read(1, remaining)?;
            for frame in &frames {
                trace!("rx {:02x?}", frame.raw());
                if let ReadStep::Done = decode(frame)? {
                    return Ok(());
                }
            }
        }
    }

    /// Write raw frames; returns how many the driver accepted.
    pub fn write(&self, frames: &[CanFrame], timeout_ms: u32) -> Result<usize> {
        for frame in frames {
            trace!("tx {:02x?}", frame.raw());
        }
        Ok(self.driver.write_msgs(self.id, frames, timeout_ms)?)
    }

    /// Serialize a logical message onto the channel. Fails unless at
    /// least one frame was accepted.
    pub fn send(&self, message: &dyn Message, timeout_ms: u32) -> Result<usize> {
        let frames = message.to_frames();
        let sent = self.write(&frames, timeout_ms)?;
        if sent < 1 {
            return Err(Error::Adapter(AdapterError::BufferFull));
        }
        Ok(sent)
    }

    /// Start a periodic transmission of the first frame of `message`.
    /// The handle is tracked and stopped on drop.
    pub fn start_periodic(&self, message: &dyn Message, interval_ms: u32) -> Result<PeriodicId> {
        let frames = message.to_frames();
        let frame = frames
            .first()
            .ok_or_else(|| Error::invalid("periodic message rendered no frames"))?;
        let id = self.driver.start_periodic(self.id, frame, interval_ms)?;
        self.periodic.lock().unwrap().push(id);
        Ok(id)
    }

    /// Stop one periodic transmission.
    pub fn stop_periodic(&self, id: PeriodicId) -> Result<()> {
        self.periodic.lock().unwrap().retain(|p| *p != id);
        Ok(self.driver.stop_periodic(self.id, id)?)
    }

    /// Stop a batch of periodic transmissions. An empty list is a
    /// no-op, so callers need not check what `start_periodic` returned.
    pub fn stop_periodic_all(&self, ids: &[PeriodicId]) {
        for id in ids {
            if let Err(e) = self.stop_periodic(*id) {
                warn!("stop_periodic({id}) failed: {e}");
            }
        }
    }

    /// Install a message filter; the handle is tracked and removed on
    /// drop.
    pub fn set_filter(
        &self,
        kind: FilterKind,
        mask: &CanFrame,
        pattern: &CanFrame,
        flow: Option<&CanFrame>,
    ) -> Result<FilterId> {
        let id = self.driver.start_filter(self.id, kind, mask, pattern, flow)?;
        self.filters.lock().unwrap().push(id);
        Ok(id)
    }

    /// Driver ioctl passthrough.
    pub fn ioctl(&self, request: &Ioctl) -> Result<()> {
        Ok(self.driver.ioctl(self.id, request)?)
    }

    /// Drop all pending received messages.
    pub fn clear_rx(&self) -> Result<()> {
        self.ioctl(&Ioctl::ClearRxBuffer)
    }

    /// Drop all queued outgoing messages.
    pub fn clear_tx(&self) -> Result<()> {
        self.ioctl(&Ioctl::ClearTxBuffer)
    }

    /// Write configuration parameters.
    pub fn set_config(&self, params: &[(ConfigParam, u32)]) -> Result<()> {
        Ok(self.driver.set_config(self.id, params)?)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let periodic: Vec<PeriodicId> = std::mem::take(&mut *self.periodic.lock().unwrap());
        for id in periodic {
            if let Err(e) = self.driver.stop_periodic(self.id, id) {
                warn!("channel {}: stop_periodic({id}) on drop failed: {e}", self.id);
            }
        }
        let filters: Vec<FilterId> = std::mem::take(&mut *self.filters.lock().unwrap());
        for id in filters {
            if let Err(e) = self.driver.stop_filter(self.id, id) {
                warn!("channel {}: stop_filter({id}) on drop failed: {e}", self.id);
            }
        }
        if let Err(e) = self.driver.disconnect(self.id) {
            warn!("channel {}: disconnect on drop failed: {e}", self.id);
        }
    }
}

/// In-memory driver that echoes writes back as received messages.
///
/// There is no bus behind it; it exists for bench runs of the CLI and
/// for exercising channel plumbing without hardware. Real backends
/// (J2534 FFI, SocketCAN) implement [`PassThru`] out of tree.
#[derive(Default)]
pub struct LoopbackDriver {
    queues: Mutex<std::collections::HashMap<ChannelId, Vec<CanFrame>>>,
    next_id: Mutex<u32>,
}

impl LoopbackDriver {
    /// A fresh driver with no channels.
    pub fn new() -> Self {
        Self::default()
    }

    fn next(&self) -> u32 {
        let mut id = self.next_id.lock().unwrap();
        *id += 1;
        *id
    }
}

impl PassThru for LoopbackDriver {
    fn connect(&self, _: Protocol, _: u32, _: u32) -> Result<ChannelId, AdapterError> {
        let id = self.next();
        self.queues.lock().unwrap().insert(id, Vec::new());
        Ok(id)
    }
    fn disconnect(&self, channel: ChannelId) -> Result<(), AdapterError> {
        self.queues.lock().unwrap().remove(&channel);
        Ok(())
    }
    fn read_msgs(
        &self,
        channel: ChannelId,
        max: usize,
        _timeout_ms: u32,
    ) -> Result<Vec<CanFrame>, AdapterError> {
        let frames: Vec<CanFrame> = {
            let mut queues = self.queues.lock().unwrap();
            let queue = queues.get_mut(&channel).ok_or(AdapterError::DeviceNotConnected)?;
            let take = max.min(queue.len());
            queue.drain(..take).collect()
        };
        if frames.is_empty() {
            // Keep timed-out polls from spinning hot.
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(frames)
    }
    fn write_msgs(
        &self,
        channel: ChannelId,
        frames: &[CanFrame],
        _timeout_ms: u32,
    ) -> Result<usize, AdapterError> {
        let mut queues = self.queues.lock().unwrap();
        let queue = queues.get_mut(&channel).ok_or(AdapterError::DeviceNotConnected)?;
        queue.extend_from_slice(frames);
        Ok(frames.len())
    }
    fn start_periodic(&self, _: ChannelId, _: &CanFrame, _: u32) -> Result<PeriodicId, AdapterError> {
        Ok(self.next())
    }
    fn stop_periodic(&self, _: ChannelId, _: PeriodicId) -> Result<(), AdapterError> {
        Ok(())
    }
    fn start_filter(
        &self,
        _: ChannelId,
        _: FilterKind,
        _: &CanFrame,
        _: &CanFrame,
        _: Option<&CanFrame>,
    ) -> Result<FilterId, AdapterError> {
        Ok(self.next())
    }
    fn stop_filter(&self, _: ChannelId, _: FilterId) -> Result<(), AdapterError> {
        Ok(())
    }
    fn ioctl(&self, channel: ChannelId, request: &Ioctl) -> Result<(), AdapterError> {
        if let Ioctl::ClearRxBuffer | Ioctl::ClearTxBuffer = request {
            if let Some(queue) = self.queues.lock().unwrap().get_mut(&channel) {
                queue.clear();
            }
        }
        Ok(())
    }
    fn set_config(&self, _: ChannelId, _: &[(ConfigParam, u32)]) -> Result<(), AdapterError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_echoes_writes() -> crate::Result<()> {
        let device = Device::open("loopback", Arc::new(LoopbackDriver::new()));
        let channel = device.connect(Protocol::Can, 0, 500_000)?;
        let frame = CanFrame::new(0x7DF, &[0x3E, 0x80]);
        channel.write(&[frame.clone()], 100)?;
        assert_eq!(channel.read(10, 100)?, vec![frame]);
        assert!(channel.read(10, 100)?.is_empty());
        Ok(())
    }

    #[test]
    fn frame_roundtrip() -> crate::Result<()> {
        let f = CanFrame::new(0x000F_FFFE, &[0xC8, 0x50, 0xB9, 0xFB]);
        assert_eq!(f.can_id(), 0x000F_FFFE);
        assert_eq!(f.payload(), &[0xC8, 0x50, 0xB9, 0xFB]);
        let g = CanFrame::from_raw(f.raw().to_vec())?;
        assert_eq!(f, g);
        Ok(())
    }

    #[test]
    fn from_raw_rejects_short() {
        assert!(CanFrame::from_raw(vec![0, 0, 0]).is_err());
    }
}

/*! ISO-TP (ISO 15765-2) framing and the UDS message wrapper.

The pass-through adapter performs ISO-TP segmentation and flow control
itself when a channel is connected with [`crate::adapter::Protocol::IsoTp`],
so [`UdsMessage`] hands the driver one message with the 4-byte
destination id prefix and lets the frame-pad TX flag do the rest.

The pure codec below is for the raw-CAN path and for validation: it
renders a payload into single/first/consecutive frames and reassembles
them, leaving flow-control frames to the driver.
*/
use crate::adapter::{CanFrame, Message};
use crate::{Error, Result};

/// Upper bound on one ISO-TP transfer (12-bit length field).
pub const MAX_TRANSFER: usize = 4095;

/// One ISO-TP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsoTpFrame {
    /// Self-contained frame, up to 7 data bytes.
    Single(Vec<u8>),
    /// First frame of a segmented transfer, carrying the 12-bit total
    /// length and the first 6 data bytes.
    First { total_len: u16, data: Vec<u8> },
    /// Consecutive frame with a 4-bit sequence number.
    Consecutive { seq: u8, data: Vec<u8> },
    /// Flow control (driver territory; decoded for completeness).
    FlowControl { status: u8, block_size: u8, st_min: u8 },
}

/// Render a payload into 8-byte CAN payloads.
pub fn encode(payload: &[u8]) -> Result<Vec<[u8; 8]>> {
    if payload.len() > MAX_TRANSFER {
        return Err(Error::invalid(format!(
            "ISO-TP payload {} exceeds {MAX_TRANSFER} bytes",
            payload.len()
        )));
    }
    let mut frames = Vec::new();
    if payload.len() <= 7 {
        let mut f = [0u8; 8];
        f[0] = payload.len() as u8;
        f[1..1 + payload.len()].copy_from_slice(payload);
        frames.push(f);
        return Ok(frames);
    }
    let mut f = [0u8; 8];
    f[0] = 0x10 | ((payload.len() >> 8) as u8 & 0x0F);
    f[1] = payload.len() as u8;
    f[2..8].copy_from_slice(&payload[..6]);
    frames.push(f);
    let mut seq = 1u8;
    for chunk in payload[6..].chunks(7) {
        let mut f = [0u8; 8];
        f[0] = 0x20 | (seq & 0x0F);
        f[1..1 + chunk.len()].copy_from_slice(chunk);
        frames.push(f);
        seq = (seq + 1) & 0x0F;
    }
    Ok(frames)
}

/// Classify one received 8-byte payload.
pub fn decode_frame(payload: &[u8]) -> Result<IsoTpFrame> {
    let pci = *payload.first().ok_or_else(|| Error::frame("empty ISO-TP frame"))?;
    Ok(match pci >> 4 {
        0x0 => {
            let len = (pci & 0x0F) as usize;
            if len > 7 || 1 + len > payload.len() {
                return Err(Error::frame(format!("bad single-frame length {len}")));
            }
            IsoTpFrame::Single(payload[1..1 + len].to_vec())
        }
        0x1 => {
            if payload.len() < 2 {
                return Err(Error::frame("truncated first frame"));
            }
            let total_len = (u16::from(pci & 0x0F) << 8) | u16::from(payload[1]);
            IsoTpFrame::First {
                total_len,
                data: payload[2..].to_vec(),
            }
        }
        0x2 => IsoTpFrame::Consecutive {
            seq: pci & 0x0F,
            data: payload[1..].to_vec(),
        },
        0x3 => IsoTpFrame::FlowControl {
            status: pci & 0x0F,
            block_size: payload.get(1).copied().unwrap_or(0),
            st_min: payload.get(2).copied().unwrap_or(0),
        },
        other => return Err(Error::frame(format!("unknown ISO-TP PCI {other:#x}"))),
    })
}

/// Reassemble an encoded sequence (no flow-control frames expected).
pub fn decode(frames: &[[u8; 8]]) -> Result<Vec<u8>> {
    let mut iter = frames.iter();
    let first = iter.next().ok_or_else(|| Error::frame("no ISO-TP frames"))?;
    let (total, mut data) = match decode_frame(first)? {
        IsoTpFrame::Single(data) => return Ok(data),
        IsoTpFrame::First { total_len, data } => (total_len as usize, data),
        other => return Err(Error::frame(format!("unexpected leading frame {other:?}"))),
    };
    let mut expected_seq = 1u8;
    for frame in iter {
        match decode_frame(frame)? {
            IsoTpFrame::Consecutive { seq, data: chunk } => {
                if seq != expected_seq {
                    return Err(Error::frame(format!(
                        "ISO-TP sequence {seq} where {expected_seq} expected"
                    )));
                }
                expected_seq = (expected_seq + 1) & 0x0F;
                data.extend_from_slice(&chunk);
            }
            other => return Err(Error::frame(format!("unexpected frame {other:?}"))),
        }
    }
    if data.len() < total {
        return Err(Error::frame("ISO-TP transfer truncated"));
    }
    data.truncate(total);
    Ok(data)
}

/// One UDS request or response on an ISO-TP channel: destination CAN id
/// plus service bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsMessage {
    can_id: u32,
    data: Vec<u8>,
}

impl UdsMessage {
    /// Build a message for `can_id`.
    pub fn new(can_id: u32, data: Vec<u8>) -> Self {
        Self { can_id, data }
    }

    /// Destination CAN id.
    pub fn can_id(&self) -> u32 {
        self.can_id
    }

    /// Service bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Message for UdsMessage {
    fn to_frames(&self) -> Vec<CanFrame> {
        vec![CanFrame::new(self.can_id, &self.data)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_frame() -> crate::Result<()> {
        let frames = encode(&[0x22, 0xF2, 0x00])?;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], [0x03, 0x22, 0xF2, 0x00, 0, 0, 0, 0]);
        assert_eq!(decode(&frames)?, vec![0x22, 0xF2, 0x00]);
        Ok(())
    }

    #[test]
    fn segmented_roundtrip() -> crate::Result<()> {
        for len in [8usize, 13, 14, 62, 100, 4095] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 255) as u8).collect();
            let frames = encode(&payload)?;
            assert_eq!(frames[0][0] & 0xF0, 0x10);
            assert_eq!(decode(&frames)?, payload, "len {len}");
        }
        assert!(encode(&vec![0u8; MAX_TRANSFER + 1]).is_err());
        Ok(())
    }

    #[test]
    fn first_frame_carries_length() -> crate::Result<()> {
        let frames = encode(&[0u8; 300])?;
        assert_eq!(frames[0][0], 0x11);
        assert_eq!(frames[0][1], 0x2C);
        Ok(())
    }

    #[test]
    fn sequence_violation_detected() -> crate::Result<()> {
        let mut frames = encode(&[0u8; 40])?;
        frames[2][0] = 0x25;
        assert!(decode(&frames).is_err());
        Ok(())
    }
}

//! D2 request/response correlation against a scripted ECU.

mod common;

use std::sync::Arc;

use candiag::Result;
use candiag::adapter::{CanFrame, Device, Protocol};
use candiag::d2::{D2_CAN_ID, D2Request};
use common::StubDriver;

fn respond(payload: &[u8]) -> CanFrame {
    let mut padded = [0u8; 8];
    padded[..payload.len()].copy_from_slice(payload);
    CanFrame::new(D2_CAN_ID, &padded)
}

/// A three-frame response series reassembles into one payload.
#[test]
fn multi_frame_response() -> Result<()> {
    let driver = Arc::new(StubDriver::new(|_, frame| {
        if frame.payload().get(2) == Some(&0xB9) {
            vec![
                respond(&[0x8F, 0x50, 0xF9, 0xFB, 1, 2, 3, 4]),
                respond(&[0x09, 5, 6, 7, 8, 9, 10, 11]),
                respond(&[0x4B, 12, 13, 14]),
            ]
        } else {
            vec![]
        }
    }));
    let device = Device::open("stub", driver);
    let channel = device.connect(Protocol::Can, 0, 500_000)?;
    let response = D2Request::new(0x50, &[0xB9, 0xFB], &[]).process(&channel, 2000)?;
    assert_eq!(response, (1..=14).collect::<Vec<u8>>());
    Ok(())
}

/// A continuation with the wrong series nibble is a frame error.
#[test]
fn wrong_series_nibble_fails() -> Result<()> {
    let driver = Arc::new(StubDriver::new(|_, frame| {
        if frame.payload().get(2) == Some(&0xB9) {
            vec![
                respond(&[0x8F, 0x50, 0xF9, 0xFB, 1, 2, 3, 4]),
                respond(&[0x08, 5, 6, 7, 8, 9, 10, 11]),
            ]
        } else {
            vec![]
        }
    }));
    let device = Device::open("stub", driver);
    let channel = device.connect(Protocol::Can, 0, 500_000)?;
    let result = D2Request::new(0x50, &[0xB9, 0xFB], &[]).process(&channel, 2000);
    assert!(matches!(result, Err(candiag::Error::Frame(_))));
    Ok(())
}

/// A negative response surfaces as a typed D2 error.
#[test]
fn negative_response() -> Result<()> {
    let driver = Arc::new(StubDriver::new(|_, frame| {
        if frame.payload().get(2) == Some(&0xB9) {
            vec![respond(&[0x8F, 0x50, 0x7F, 0xB9, 0x31])]
        } else {
            vec![]
        }
    }));
    let device = Device::open("stub", driver);
    let channel = device.connect(Protocol::Can, 0, 500_000)?;
    let result = D2Request::new(0x50, &[0xB9, 0xFB], &[]).process(&channel, 2000);
    assert_eq!(result, Err(candiag::Error::D2(0x31)));
    Ok(())
}

/// Frames from unrelated exchanges are skipped, not misparsed.
#[test]
fn unrelated_frames_are_skipped() -> Result<()> {
    let driver = Arc::new(StubDriver::new(|_, frame| {
        if frame.payload().get(2) == Some(&0xB9) {
            vec![
                // Another ECU answering something else.
                respond(&[0xCB, 0x7A, 0xE6, 0x01]),
                respond(&[0xCC, 0x50, 0xF9, 0xFB, 0x42]),
            ]
        } else {
            vec![]
        }
    }));
    let device = Device::open("stub", driver);
    let channel = device.connect(Protocol::Can, 0, 500_000)?;
    let response = D2Request::new(0x50, &[0xB9, 0xFB], &[]).process(&channel, 2000)?;
    assert_eq!(response, vec![0x42, 0, 0, 0]);
    Ok(())
}

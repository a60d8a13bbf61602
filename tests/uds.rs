//! UDS request processing against a scripted ECU.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use candiag::Result;
use candiag::adapter::{CanFrame, Device, Protocol};
use candiag::uds::UdsRequest;
use candiag::uds_steps;
use common::StubDriver;

/// Authorize with a known PIN: the stub hands out the captured seed
/// and only accepts the exact key bytes of the reference algorithm.
#[test]
fn authorize_success_without_retries() -> Result<()> {
    let seed_requests = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seed_requests);
    let driver = Arc::new(StubDriver::new(move |_, frame| {
        match frame.payload() {
            [0x27, 0x01] => {
                counter.fetch_add(1, Ordering::SeqCst);
                vec![CanFrame::new(0x7E8, &[0x67, 0x01, 0xE5, 0x1E, 0x8F])]
            }
            [0x27, 0x02, 0x8B, 0x62, 0xCD] => vec![CanFrame::new(0x7E8, &[0x67, 0x02])],
            [0x27, 0x02, ..] => vec![CanFrame::new(0x7E8, &[0x7F, 0x27, 0x35])],
            _ => vec![],
        }
    }));
    let device = Device::open("stub", driver);
    let channel = device.connect(Protocol::IsoTp, 0, 500_000)?;
    uds_steps::authorize(&channel, 0x7E0, &[0x00, 0x00, 0xD3, 0x5D, 0x6F])?;
    assert_eq!(seed_requests.load(Ordering::SeqCst), 1);
    Ok(())
}

/// A wrong PIN derives a wrong key, which the stub answers with
/// "invalid key".
#[test]
fn authorize_wrong_pin_fails() -> Result<()> {
    let driver = Arc::new(StubDriver::new(|_, frame| match frame.payload() {
        [0x27, 0x01] => vec![CanFrame::new(0x7E8, &[0x67, 0x01, 0xE5, 0x1E, 0x8F])],
        [0x27, 0x02, 0x8B, 0x62, 0xCD] => vec![CanFrame::new(0x7E8, &[0x67, 0x02])],
        [0x27, 0x02, ..] => vec![CanFrame::new(0x7E8, &[0x7F, 0x27, 0x35])],
        _ => vec![],
    }));
    let device = Device::open("stub", driver);
    let channel = device.connect(Protocol::IsoTp, 0, 500_000)?;
    let result = uds_steps::authorize(&channel, 0x7E0, &[0, 0, 0, 0, 1]);
    assert_eq!(result, Err(candiag::Error::Uds(0x35)));
    Ok(())
}

/// "Response pending" frames are absorbed by the read loop; the real
/// response lands in the caller's hands without consuming retries.
#[test]
fn response_pending_is_absorbed() -> Result<()> {
    let driver = Arc::new(StubDriver::new(|_, frame| match frame.payload() {
        [0x22, 0xF1, 0x90] => vec![
            CanFrame::new(0x7E8, &[0x7F, 0x22, 0x78]),
            CanFrame::new(0x7E8, &[0x7F, 0x22, 0x78]),
            CanFrame::new(0x7E8, &[0x62, 0xF1, 0x90, 0x59, 0x56, 0x31]),
        ],
        _ => vec![],
    }));
    let device = Device::open("stub", driver);
    let channel = device.connect(Protocol::IsoTp, 0, 500_000)?;
    let response = UdsRequest::new(0x7E0, vec![0x22, 0xF1, 0x90])?.process(&channel, 2000)?;
    assert_eq!(&response[4..], &[0x62, 0xF1, 0x90, 0x59, 0x56, 0x31]);
    Ok(())
}

/// A real negative response code still fails the request.
#[test]
fn other_nrc_propagates() -> Result<()> {
    let driver = Arc::new(StubDriver::new(|_, frame| match frame.payload() {
        [0x22, ..] => vec![CanFrame::new(0x7E8, &[0x7F, 0x22, 0x31])],
        _ => vec![],
    }));
    let device = Device::open("stub", driver);
    let channel = device.connect(Protocol::IsoTp, 0, 500_000)?;
    let result = UdsRequest::new(0x7E0, vec![0x22, 0xF1, 0x90])?.process(&channel, 2000);
    assert_eq!(result, Err(candiag::Error::Uds(0x31)));
    Ok(())
}

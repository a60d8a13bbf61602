//! TP 2.0 session negotiation and exchanges against a scripted ECU.

mod common;

use std::sync::Arc;
use std::time::Duration;

use candiag::Result;
use candiag::adapter::{CanFrame, Device, Protocol};
use candiag::config::CarPlatform;
use candiag::processor::{RequestProcessor, Tp20Processor};
use candiag::tp20::Tp20Session;
use common::StubDriver;

/// ECU side of the handshake: accept the channel setup on 0x200,
/// grant tx id 0x340, window 8, minimum delay 50 ms, and answer data
/// frames with an ack plus one single-frame response.
fn scripted_ecu() -> impl FnMut(u32, &CanFrame) -> Vec<CanFrame> + Send + 'static {
    move |_, frame| {
        let payload = frame.payload();
        match frame.can_id() {
            0x200 if payload.len() >= 7 && payload[1] == 0x20 => {
                vec![CanFrame::new(0x201, &[0x00, 0xD0, 0x00, 0x03, 0x40, 0x03, 0x01])]
            }
            0x340 if payload.first() == Some(&0xA0) => {
                vec![CanFrame::new(0x300, &[0xA1, 0x08, 0x8A, 0xFF, 0x72, 0xFF])]
            }
            0x340 if payload.first().is_some_and(|p| p & 0xF0 == 0x10) => {
                let ack = 0xB0 | ((payload[0] + 1) & 0x0F);
                vec![
                    CanFrame::new(0x300, &[ack]),
                    CanFrame::new(0x300, &[0x10, 0x00, 0x02, 0x50, 0x89]),
                ]
            }
            _ => vec![],
        }
    }
}

#[test]
fn session_setup_negotiates_parameters() -> Result<()> {
    let driver = Arc::new(StubDriver::new(scripted_ecu()));
    let device = Device::open("stub", Arc::clone(&driver) as Arc<dyn candiag::adapter::PassThru>);
    let channel = device.connect(Protocol::Can, 0, 500_000)?;
    let mut session = Tp20Session::new(&channel, CarPlatform::Vag, 0x01);
    session.start()?;
    assert_eq!(session.max_pkts_till_ack(), 8);
    assert_eq!(session.min_send_delay(), Duration::from_millis(50));
    // Keep-alive scheduled on the negotiated tx channel at 1000 ms.
    let periodics = driver.periodics();
    assert!(
        periodics
            .iter()
            .any(|(_, frame, interval)| frame.can_id() == 0x340
                && frame.payload() == [0xA3]
                && *interval == 1000)
    );
    Ok(())
}

#[test]
fn short_exchange_roundtrips() -> Result<()> {
    let driver = Arc::new(StubDriver::new(scripted_ecu()));
    let device = Device::open("stub", Arc::clone(&driver) as Arc<dyn candiag::adapter::PassThru>);
    let channel = device.connect(Protocol::Can, 0, 500_000)?;
    let mut session = Tp20Session::new(&channel, CarPlatform::Vag, 0x01);
    session.start()?;
    let response = session.process(&[0x10, 0x89])?;
    assert_eq!(response, vec![0x00, 0x02, 0x50, 0x89]);
    // The reply was ack-required, so an ack with the next sequence
    // nibble went out.
    let writes = driver.writes();
    assert!(
        writes
            .iter()
            .any(|(_, frame)| frame.can_id() == 0x340 && frame.payload() == [0xB1])
    );
    Ok(())
}

#[test]
fn processor_strips_length_prefix_and_maps_errors() -> Result<()> {
    let driver = Arc::new(StubDriver::new(scripted_ecu()));
    let device = Device::open("stub", Arc::clone(&driver) as Arc<dyn candiag::adapter::PassThru>);
    let channel = device.connect(Protocol::Can, 0, 500_000)?;
    let mut session = Tp20Session::new(&channel, CarPlatform::Vag, 0x01);
    session.start()?;
    let mut processor = Tp20Processor::new(&mut session);
    let response = processor.process(&[0x10, 0x89], &[], 1000)?;
    assert_eq!(response, vec![0x50, 0x89]);
    Ok(())
}

#[test]
fn fragmented_send_sequences_and_window() -> Result<()> {
    let driver = Arc::new(StubDriver::new(scripted_ecu()));
    let device = Device::open("stub", Arc::clone(&driver) as Arc<dyn candiag::adapter::PassThru>);
    let channel = device.connect(Protocol::Can, 0, 500_000)?;
    let mut session = Tp20Session::new(&channel, CarPlatform::Vag, 0x01);
    session.start()?;
    // 19 bytes fragment into three payloads; the first two need no
    // ack, the last one does.
    let request: Vec<u8> = (0..19).collect();
    session.process(&request)?;
    let data_ops: Vec<u8> = driver
        .writes()
        .iter()
        .filter(|(_, frame)| {
            frame.can_id() == 0x340
                && frame
                    .payload()
                    .first()
                    .is_some_and(|p| matches!(p & 0xF0, 0x10 | 0x20))
        })
        .map(|(_, frame)| frame.payload()[0])
        .collect();
    assert_eq!(data_ops, vec![0x20, 0x21, 0x12]);
    Ok(())
}

#[test]
fn oversized_request_rejected() -> Result<()> {
    let driver = Arc::new(StubDriver::new(scripted_ecu()));
    let device = Device::open("stub", Arc::clone(&driver) as Arc<dyn candiag::adapter::PassThru>);
    let channel = device.connect(Protocol::Can, 0, 500_000)?;
    let mut session = Tp20Session::new(&channel, CarPlatform::Vag, 0x01);
    session.start()?;
    let result = session.process(&vec![0u8; 4097]);
    assert!(matches!(result, Err(candiag::Error::InvalidArgument(_))));
    Ok(())
}

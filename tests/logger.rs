//! Logger sampling cadence and decoding against a scripted ECU.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use candiag::Result;
use candiag::adapter::{CanFrame, Device};
use candiag::config::CarPlatform;
use candiag::d2::D2_CAN_ID;
use candiag::logger::{Logger, LoggerCallback};
use candiag::params::{DataType, LogParameter, LogParameters};
use common::StubDriver;

#[derive(Default)]
struct Collector {
    records: Mutex<Vec<(u64, Vec<f64>)>>,
    status: Mutex<Vec<bool>>,
}

impl LoggerCallback for Collector {
    fn on_status_changed(&self, started: bool) {
        self.status.lock().unwrap().push(started);
    }
    fn on_record(&self, timestamp_ms: u64, values: &[f64]) {
        self.records.lock().unwrap().push((timestamp_ms, values.to_vec()));
    }
}

fn d2_respond(payload: &[u8]) -> CanFrame {
    let mut padded = [0u8; 8];
    padded[..payload.len()].copy_from_slice(payload);
    CanFrame::new(D2_CAN_ID, &padded)
}

/// ECU side of the D2 logger dialogue: acknowledge registration,
/// answer each record request with one frame carrying RPM = 750 and
/// IAT raw 0xF0.
fn scripted_ecm() -> impl FnMut(u32, &CanFrame) -> Vec<CanFrame> + Send {
    move |_, frame| {
        let p = frame.payload();
        if p.len() < 4 {
            return vec![];
        }
        match (p[2], p[3]) {
            // Unregister-all and register-address echo positively.
            (0xAA, 0x00) => vec![d2_respond(&[0xCB, 0x7A, 0xEA, 0x00])],
            (0xAA, 0x50) => vec![d2_respond(&[0xCC, 0x7A, 0xEA, 0x50])],
            // One measurement record: 0x19 << 8 | 0x00... RPM raw 25,
            // IAT raw 0xF0.
            (0xA6, 0xF0) => vec![d2_respond(&[0x8F, 0x7A, 0xE6, 0xF0, 0x00, 0x00, 0x19, 0xF0])],
            _ => vec![],
        }
    }
}

fn sheet() -> LogParameters {
    LogParameters::new(vec![
        LogParameter::new("RPM", 0x100A, 2, DataType::Int, 0xFFFF, "rpm", false, false, 30.0, 0.0, "")
            .unwrap(),
        LogParameter::new("IAT", 0x10C4, 1, DataType::Int, 0xFF, "C", true, false, 0.75, -48.0, "")
            .unwrap(),
    ])
}

#[test]
fn d2_sampling_and_decode() -> Result<()> {
    let driver = Arc::new(StubDriver::new(scripted_ecm()));
    let device = Device::open(
        "stub",
        Arc::clone(&driver) as Arc<dyn candiag::adapter::PassThru>,
    );
    let collector = Arc::new(Collector::default());
    let mut logger = Logger::new(device, CarPlatform::P2, 0x7A)?;
    logger.register_callback(Arc::clone(&collector) as Arc<dyn LoggerCallback>);
    logger.start(sheet())?;
    std::thread::sleep(Duration::from_millis(320));
    logger.stop();

    let status = collector.status.lock().unwrap().clone();
    assert_eq!(status.first(), Some(&true));
    assert_eq!(status.last(), Some(&false));

    let records = collector.records.lock().unwrap().clone();
    // 50 ms grid over ~320 ms: several samples, no burst catch-up.
    assert!(records.len() >= 3, "only {} records", records.len());
    assert!(records.len() <= 8, "{} records", records.len());
    for (_, values) in &records {
        assert_eq!(values.len(), 2);
        // RPM raw 25 × 30, IAT raw 0xF0 sign-extended to -16.
        assert_eq!(values[0], 750.0);
        assert_eq!(values[1], -16.0 * 0.75 - 48.0);
    }
    // Timestamps are strictly monotonic.
    assert!(records.windows(2).all(|w| w[0].0 < w[1].0));

    // Registration ran: unregister-all, then one register per
    // parameter.
    let writes = driver.writes();
    let registers = writes
        .iter()
        .filter(|(_, frame)| frame.payload().get(2) == Some(&0xAA) && frame.payload()[3] == 0x50)
        .count();
    assert_eq!(registers, 2);
    Ok(())
}

#[test]
fn logger_rejects_unknown_backend() -> Result<()> {
    let driver = Arc::new(StubDriver::new(|_, _| vec![]));
    let device = Device::open("stub", driver);
    assert!(Logger::new(device, CarPlatform::P2, 0x51).is_err());
    Ok(())
}

//! Full flash-plan runs against a scripted ECU.

mod common;

use std::sync::{Arc, Mutex};

use candiag::Result;
use candiag::adapter::{CanFrame, Device};
use candiag::checksum::crc16;
use candiag::config::CarPlatform;
use candiag::flasher::{
    FixedSbl, FlashKind, Flasher, FlasherCallback, FlasherParameters, FlasherState,
};
use candiag::vbf::{Vbf, VbfChunk, VbfHeader};
use common::StubDriver;

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<FlasherState>>,
    progress: Mutex<Vec<(usize, usize)>>,
}

impl FlasherCallback for Recorder {
    fn on_state(&self, state: FlasherState) {
        self.states.lock().unwrap().push(state);
    }
    fn on_progress(&self, current: usize, maximum: usize) {
        self.progress.lock().unwrap().push((current, maximum));
    }
}

fn artifact(offset: u32, data: Vec<u8>, call: u32) -> Vbf {
    Vbf {
        header: VbfHeader { version: 2.0, call, ..Default::default() },
        chunks: vec![VbfChunk::new(offset, data)],
    }
}

/// ECU script for a UDS flash. `erase_ok` decides whether the erase
/// routine succeeds or answers "request out of range".
fn scripted_ecu(sbl_crc: u16, flash_crc: u16, erase_ok: bool) -> impl FnMut(u32, &CanFrame) -> Vec<CanFrame> + Send {
    let mut transfers = 0usize;
    move |_, frame| {
        let p = frame.payload();
        match p {
            [0x27, 0x01] => vec![CanFrame::new(0x7E8, &[0x67, 0x01, 0xE5, 0x1E, 0x8F])],
            [0x27, 0x02, ..] => vec![CanFrame::new(0x7E8, &[0x67, 0x02])],
            [0x34, ..] => vec![CanFrame::new(0x7E8, &[0x74, 0x20, 0x00, 0x12])],
            [0x36, counter, ..] => vec![CanFrame::new(0x7E8, &[0x76, *counter])],
            [0x37] => {
                // First transfer-exit closes the SBL, the second the
                // flash payload.
                transfers += 1;
                let crc = if transfers == 1 { sbl_crc } else { flash_crc };
                vec![CanFrame::new(0x7E8, &[0x77, (crc >> 8) as u8, crc as u8])]
            }
            [0x31, 0x01, 0x03, 0x01, ..] => {
                vec![CanFrame::new(0x7E8, &[0x71, 0x01, 0x03, 0x01])]
            }
            [0x31, 0x01, 0xFF, 0x00, ..] => {
                if erase_ok {
                    vec![CanFrame::new(0x7E8, &[0x71, 0x01, 0xFF, 0x00, 0x00, 0x00])]
                } else {
                    vec![CanFrame::new(0x7E8, &[0x7F, 0x31, 0x31])]
                }
            }
            _ => vec![],
        }
    }
}

fn run_uds_flash(erase_ok: bool) -> Result<(Arc<Recorder>, Arc<StubDriver>)> {
    let sbl_data: Vec<u8> = (0u8..16).collect();
    let flash_data: Vec<u8> = (0x80u8..0x88).collect();
    let sbl = artifact(0x8000, sbl_data.clone(), 0x18000);
    let flash = artifact(0x4000, flash_data.clone(), 0);
    let driver = Arc::new(StubDriver::new(scripted_ecu(
        crc16(&sbl_data),
        crc16(&flash_data),
        erase_ok,
    )));
    let device = Device::open("stub", Arc::clone(&driver) as Arc<dyn candiag::adapter::PassThru>);
    let recorder = Arc::new(Recorder::default());
    let mut flasher = Flasher::new(
        device,
        FlashKind::UdsFlash,
        FlasherParameters {
            platform: CarPlatform::P3,
            ecu_id: 0x10,
            pin: [0x00, 0x00, 0xD3, 0x5D, 0x6F],
            extra_info: String::new(),
            clock: None,
            flash,
            sbl_provider: Arc::new(FixedSbl(sbl)),
        },
    );
    flasher.register_callback(Arc::clone(&recorder) as Arc<dyn FlasherCallback>);
    flasher.start()?;
    flasher.join();
    Ok((recorder, driver))
}

#[test]
fn uds_flash_completes() -> Result<()> {
    let (recorder, driver) = run_uds_flash(true)?;
    let states = recorder.states.lock().unwrap().clone();
    assert_eq!(states.last(), Some(&FlasherState::Done));
    for expected in [
        FlasherState::OpenChannels,
        FlasherState::FallAsleep,
        FlasherState::Authorize,
        FlasherState::LoadBootloader,
        FlasherState::StartBootloader,
        FlasherState::EraseFlash,
        FlasherState::WriteFlash,
        FlasherState::WakeUp,
        FlasherState::CloseChannels,
    ] {
        assert!(states.contains(&expected), "missing state {expected:?}");
    }
    // The keep-alive heart-beat ran at the 1900 ms tester-present
    // cadence.
    assert!(
        driver
            .periodics()
            .iter()
            .any(|(_, frame, interval)| frame.payload() == [0x3E, 0x80] && *interval == 1900)
    );
    // Progress never decreases and ends complete.
    let progress = recorder.progress.lock().unwrap().clone();
    assert!(progress.windows(2).all(|w| w[0].0 <= w[1].0));
    let (current, maximum) = *progress.last().unwrap();
    assert_eq!(current, maximum);
    Ok(())
}

#[test]
fn wake_up_runs_after_erase_failure() -> Result<()> {
    let (recorder, _) = run_uds_flash(false)?;
    let states = recorder.states.lock().unwrap().clone();
    assert_eq!(states.last(), Some(&FlasherState::Error));
    let erase_at = states
        .iter()
        .position(|s| *s == FlasherState::EraseFlash)
        .expect("erase step missing");
    let wakeup_at = states
        .iter()
        .position(|s| *s == FlasherState::WakeUp)
        .expect("wake-up compensation missing");
    assert!(wakeup_at > erase_at);
    assert_eq!(
        states.iter().filter(|s| **s == FlasherState::WakeUp).count(),
        1
    );
    // Progress still reaches the maximum so the bar completes.
    let progress = recorder.progress.lock().unwrap().clone();
    assert!(progress.windows(2).all(|w| w[0].0 <= w[1].0));
    let (current, maximum) = *progress.last().unwrap();
    assert_eq!(current, maximum);
    Ok(())
}

/*! Security-access PIN scanner: walk a 24-bit PIN space until the ECU
accepts a key, sharing the authorize step with the flasher.

The scan keeps the bus asleep and a tester-present heart-beat running,
then tries one authorization per candidate PIN. The state callback
fires on every attempt, so a caller can show the moving PIN.
*/
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{info, warn};

use crate::adapter::{Channel, Device};
use crate::config::{self, CarPlatform};
use crate::security::pin_array;
use crate::uds_steps;
use crate::{Error, Result};

/// States of a scan. Terminal: [`PinFinderState::Done`] and
/// [`PinFinderState::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PinFinderState {
    Initial,
    FallAsleep,
    KeepAlive,
    Work,
    WakeUp,
    Done,
    Error,
}

/// Scan direction from the start value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Increment the candidate PIN.
    Up,
    /// Decrement the candidate PIN.
    Down,
}

/// State observer: `(state, current PIN)`, fired on the worker thread
/// for every state change and every attempt.
pub type StateCallback = Arc<dyn Fn(PinFinderState, u64) + Send + Sync>;

const PIN_SPACE_MASK: u64 = 0xFF_FFFF;

struct Shared {
    device: Device,
    platform: CarPlatform,
    ecu_id: u8,
    direction: Direction,
    state: Mutex<PinFinderState>,
    current_pin: Mutex<u64>,
    found_pin: Mutex<Option<u64>>,
    stop: AtomicBool,
    callback: Option<StateCallback>,
}

impl Shared {
    fn set_state(&self, state: PinFinderState) {
        *self.state.lock().unwrap() = state;
        if let Some(cb) = &self.callback {
            cb(state, *self.current_pin.lock().unwrap());
        }
    }
}

/// A PIN scan job.
pub struct PinFinder {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PinFinder {
    /// Create a scan starting at `start_pin`.
    pub fn new(
        device: Device,
        platform: CarPlatform,
        ecu_id: u8,
        direction: Direction,
        start_pin: u64,
        callback: Option<StateCallback>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                device,
                platform,
                ecu_id,
                direction,
                state: Mutex::new(PinFinderState::Initial),
                current_pin: Mutex::new(start_pin & PIN_SPACE_MASK),
                found_pin: Mutex::new(None),
                stop: AtomicBool::new(false),
                callback,
            }),
            worker: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> PinFinderState {
        *self.shared.state.lock().unwrap()
    }

    /// The PIN that authorized successfully, if any.
    pub fn found_pin(&self) -> Option<u64> {
        *self.shared.found_pin.lock().unwrap()
    }

    /// Request a stop; the wake-up still runs.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }

    /// Spawn the worker thread.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() || self.state() != PinFinderState::Initial {
            return Err(Error::invalid("PIN scan already started"));
        }
        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name("pin-finder".to_string())
            .spawn(move || {
                if let Err(e) = run_scan(&shared) {
                    warn!("PIN scan aborted: {e}");
                    shared.set_state(PinFinderState::Error);
                }
            })
            .map_err(|e| Error::invalid(format!("cannot spawn scan thread: {e}")))?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Wait for the scan to reach a terminal state.
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for PinFinder {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn run_scan(shared: &Shared) -> Result<()> {
    let (_, ecu) = config::ecu_info(shared.platform, shared.ecu_id)?;
    let channels: Vec<Channel> =
        config::open_all_channels(&shared.device, shared.platform, shared.ecu_id)?;
    let index = config::channel_index_for_ecu(shared.platform, shared.ecu_id)?;
    let channel = &channels[index];

    let mut failed = false;
    shared.set_state(PinFinderState::FallAsleep);
    if let Err(e) = uds_steps::fall_asleep(&channels) {
        warn!("fall asleep failed: {e}");
        failed = true;
    }
    let mut keepalive = None;
    if !failed {
        shared.set_state(PinFinderState::KeepAlive);
        match uds_steps::keep_alive(channel) {
            Ok(id) => keepalive = Some(id),
            Err(e) => {
                warn!("keep-alive failed: {e}");
                failed = true;
            }
        }
    }

    if !failed {
        loop {
            if shared.stop.load(Ordering::Relaxed) {
                break;
            }
            let pin = *shared.current_pin.lock().unwrap();
            shared.set_state(PinFinderState::Work);
            match uds_steps::authorize(channel, ecu.can_id, &pin_array(pin)) {
                Ok(()) => {
                    info!("PIN found: {pin:06X}");
                    *shared.found_pin.lock().unwrap() = Some(pin);
                    break;
                }
                Err(_) => {
                    let next = match shared.direction {
                        Direction::Up => pin.wrapping_add(1),
                        Direction::Down => pin.wrapping_sub(1),
                    } & PIN_SPACE_MASK;
                    *shared.current_pin.lock().unwrap() = next;
                }
            }
        }
    }

    shared.set_state(PinFinderState::WakeUp);
    if let Some(id) = keepalive {
        channel.stop_periodic_all(&[id]);
    }
    uds_steps::wake_up(&channels);
    if failed {
        shared.set_state(PinFinderState::Error);
    } else {
        shared.set_state(PinFinderState::Done);
    }
    Ok(())
}

/*! Flasher orchestration: a plan-driven state machine that composes the
protocol steps into a full reflash (or read-out) and reports state and
progress through callbacks.

Four plans exist: UDS flash, D2 flash, D2 read, and KWP flash over
TP 2.0 or ISO-TP. A plan is a linear sequence of steps; each step
carries its progress share and whether it may be skipped once an
earlier step has failed. The wake-up compensation and the channel
close-down are never skipped, so a car is not left asleep by a failed
job.

```no_run
use std::sync::Arc;
use candiag::adapter::Device;
use candiag::config::CarPlatform;
use candiag::flasher::{FlashKind, Flasher, FlasherParameters, NoSbl};
# fn demo(device: Device, vbf: candiag::vbf::Vbf) -> candiag::Result<()> {
let mut flasher = Flasher::new(
    device,
    FlashKind::UdsFlash,
    FlasherParameters {
        platform: CarPlatform::P3,
        ecu_id: 0x10,
        pin: [0, 0, 0x12, 0x34, 0x56],
        extra_info: String::new(),
        clock: None,
        flash: vbf,
        sbl_provider: Arc::new(NoSbl),
    },
);
flasher.start()?;
flasher.join();
# Ok(())
# }
```
*/
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::adapter::{Channel, Device};
use crate::config::{self, CarPlatform};
use crate::processor::{RequestProcessor, Tp20Processor, UdsProcessor};
use crate::tp20::Tp20Session;
use crate::vbf::Vbf;
use crate::{d2_steps, kwp_steps, uds_steps};
use crate::{Error, Result};

/// States a flash job moves through. Terminal states are
/// [`FlasherState::Done`] and [`FlasherState::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum FlasherState {
    Initial,
    OpenChannels,
    FallAsleep,
    Authorize,
    ProgrammingSession,
    LoadBootloader,
    StartBootloader,
    RequestDownload,
    EraseFlash,
    WriteFlash,
    ReadFlash,
    WakeUp,
    CloseChannels,
    Done,
    Error,
}

/// Observer of a running flash job. Callbacks fire on the worker
/// thread and must not block.
pub trait FlasherCallback: Send + Sync {
    /// The job entered a new state.
    fn on_state(&self, _state: FlasherState) {}
    /// Progress moved. `maximum` is stable for the lifetime of a job.
    fn on_progress(&self, _current: usize, _maximum: usize) {}
}

/// Source of the secondary bootloader for a platform/ECU pair.
pub trait SblProvider: Send + Sync {
    /// The SBL artifact, if one is required and known.
    fn sbl(&self, platform: CarPlatform, ecu_id: u8, extra_info: &str) -> Option<Vbf>;
}

/// Provider that always hands out one fixed artifact.
pub struct FixedSbl(pub Vbf);

impl SblProvider for FixedSbl {
    fn sbl(&self, _platform: CarPlatform, _ecu_id: u8, _extra_info: &str) -> Option<Vbf> {
        Some(self.0.clone())
    }
}

/// Provider for plans that need no secondary bootloader.
pub struct NoSbl;

impl SblProvider for NoSbl {
    fn sbl(&self, _platform: CarPlatform, _ecu_id: u8, _extra_info: &str) -> Option<Vbf> {
        None
    }
}

/// Which plan to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashKind {
    /// UDS reflash over ISO-TP.
    UdsFlash,
    /// D2 reflash through the primary/secondary bootloader chain.
    D2Flash,
    /// D2 flash read-out.
    D2Read {
        /// First address to read.
        start: u32,
        /// Number of bytes to read.
        size: u32,
    },
    /// KWP 2000 reflash over TP 2.0 (or ISO-TP, by bus table).
    KwpFlash,
}

/// Everything a flash job needs to know.
pub struct FlasherParameters {
    /// Target platform.
    pub platform: CarPlatform,
    /// Target ECU id.
    pub ecu_id: u8,
    /// Security-access PIN.
    pub pin: [u8; 5],
    /// Extra module qualifier (e.g. `"me9_p3"`).
    pub extra_info: String,
    /// Local time for the dashboard clock after a D2 flash.
    pub clock: Option<(u8, u8)>,
    /// The artifact to write (ignored by read plans).
    pub flash: Vbf,
    /// Secondary bootloader source.
    pub sbl_provider: Arc<dyn SblProvider>,
}

const SIMPLE_STEP: usize = 100;

struct Shared {
    device: Device,
    kind: FlashKind,
    params: FlasherParameters,
    state: Mutex<FlasherState>,
    progress: Mutex<(usize, usize)>,
    callbacks: Mutex<Vec<Arc<dyn FlasherCallback>>>,
    stop: AtomicBool,
    read_data: Mutex<Option<Vec<u8>>>,
}

impl Shared {
    fn snapshot_callbacks(&self) -> Vec<Arc<dyn FlasherCallback>> {
        self.callbacks.lock().unwrap().clone()
    }

    fn set_state(&self, state: FlasherState) {
        *self.state.lock().unwrap() = state;
        debug!("flasher state → {state:?}");
        for cb in self.snapshot_callbacks() {
            cb.on_state(state);
        }
    }

    fn set_max_progress(&self, maximum: usize) {
        let mut guard = self.progress.lock().unwrap();
        guard.1 = maximum;
    }

    fn inc_progress(&self, amount: usize) {
        let (current, maximum) = {
            let mut guard = self.progress.lock().unwrap();
            guard.0 = (guard.0 + amount).min(guard.1);
            *guard
        };
        for cb in self.snapshot_callbacks() {
            cb.on_progress(current, maximum);
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }
}

/// Runs the plan steps, threading the `previous_failed` flag and
/// keeping the progress account.
struct StepRunner<'a> {
    shared: &'a Shared,
    failed: bool,
}

impl<'a> StepRunner<'a> {
    fn new(shared: &'a Shared) -> Self {
        Self { shared, failed: false }
    }

    /// Run one plan step. A step whose `skip_on_error` is set is
    /// skipped once an earlier step has failed (or a stop was
    /// requested); its progress share is still accounted so the bar
    /// reaches the end.
    fn step<F>(&mut self, state: FlasherState, max_progress: usize, skip_on_error: bool, f: F)
    where
        F: FnOnce(&mut dyn FnMut(usize)) -> Result<()>,
    {
        self.shared.set_state(state);
        if self.shared.stop_requested() && skip_on_error {
            self.failed = true;
        }
        let mut added = 0usize;
        if !(self.failed && skip_on_error) {
            let shared = self.shared;
            let result = f(&mut |amount| {
                added += amount;
                shared.inc_progress(amount);
            });
            if let Err(e) = result {
                warn!("step {state:?} failed: {e}");
                self.failed = true;
            }
        }
        if added < max_progress {
            self.shared.inc_progress(max_progress - added);
        }
    }

    fn finish(self) {
        if self.failed {
            self.shared.set_state(FlasherState::Error);
        } else {
            self.shared.set_state(FlasherState::Done);
        }
    }
}

/// A flash job. Construct, register callbacks, call
/// [`Flasher::start`]; the plan runs on a worker thread.
pub struct Flasher {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Flasher {
    /// Create a job over an opened device.
    pub fn new(device: Device, kind: FlashKind, params: FlasherParameters) -> Self {
        Self {
            shared: Arc::new(Shared {
                device,
                kind,
                params,
                state: Mutex::new(FlasherState::Initial),
                progress: Mutex::new((0, 0)),
                callbacks: Mutex::new(Vec::new()),
                stop: AtomicBool::new(false),
                read_data: Mutex::new(None),
            }),
            worker: None,
        }
    }

    /// Register an observer. May be called from any thread.
    pub fn register_callback(&self, callback: Arc<dyn FlasherCallback>) {
        self.shared.callbacks.lock().unwrap().push(callback);
    }

    /// Current state.
    pub fn state(&self) -> FlasherState {
        *self.shared.state.lock().unwrap()
    }

    /// Current and maximum progress.
    pub fn progress(&self) -> (usize, usize) {
        *self.shared.progress.lock().unwrap()
    }

    /// The bytes read by a [`FlashKind::D2Read`] job, once done.
    pub fn read_data(&self) -> Option<Vec<u8>> {
        self.shared.read_data.lock().unwrap().clone()
    }

    /// Request a stop. Observed between plan steps; the wake-up
    /// compensation still runs.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Relaxed);
    }

    /// Spawn the worker thread and run the plan.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() || self.state() != FlasherState::Initial {
            return Err(Error::invalid("flasher already started"));
        }
        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name("flasher".to_string())
            .spawn(move || run_plan(&shared))
            .map_err(|e| Error::invalid(format!("cannot spawn flasher thread: {e}")))?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Wait for the job to reach a terminal state.
    pub fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Flasher {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

fn run_plan(shared: &Shared) {
    let result = match shared.kind {
        FlashKind::UdsFlash => run_uds_flash(shared),
        FlashKind::D2Flash => run_d2_flash(shared),
        FlashKind::D2Read { start, size } => run_d2_read(shared, start, size),
        FlashKind::KwpFlash => run_kwp_flash(shared),
    };
    if let Err(e) = result {
        warn!("flash job aborted: {e}");
        shared.set_state(FlasherState::Error);
    }
}

fn progress_of(vbf: &Vbf) -> usize {
    vbf.total_size()
}

fn run_uds_flash(shared: &Shared) -> Result<()> {
    let params = &shared.params;
    let (_, ecu) = config::ecu_info(params.platform, params.ecu_id)?;
    let sbl = params
        .sbl_provider
        .sbl(params.platform, params.ecu_id, &params.extra_info)
        .ok_or_else(|| Error::flash("secondary bootloader not found"))?;
    let flash = &params.flash;
    shared.set_max_progress(
        SIMPLE_STEP * 6
            + progress_of(&sbl)
            + SIMPLE_STEP * flash.chunks.len()
            + progress_of(flash),
    );

    let mut runner = StepRunner::new(shared);
    let mut channels: Vec<Channel> = Vec::new();
    runner.step(FlasherState::OpenChannels, SIMPLE_STEP, true, |_| {
        channels = config::open_all_channels(&shared.device, params.platform, params.ecu_id)?;
        Ok(())
    });
    if channels.is_empty() {
        runner.finish();
        return Ok(());
    }
    let index = config::channel_index_for_ecu(params.platform, params.ecu_id)?;
    let can_id = ecu.can_id;

    runner.step(FlasherState::FallAsleep, SIMPLE_STEP, true, |_| {
        uds_steps::fall_asleep(&channels)
    });
    let mut keepalive = None;
    runner.step(FlasherState::Authorize, SIMPLE_STEP, true, |_| {
        keepalive = Some(uds_steps::keep_alive(&channels[index])?);
        uds_steps::authorize(&channels[index], can_id, &params.pin)
    });
    runner.step(FlasherState::LoadBootloader, progress_of(&sbl), true, |progress| {
        uds_steps::transfer_data(&channels[index], can_id, &sbl, progress)
    });
    runner.step(FlasherState::StartBootloader, SIMPLE_STEP, true, |_| {
        uds_steps::start_routine(&channels[index], can_id, sbl.header.call)
    });
    runner.step(
        FlasherState::EraseFlash,
        SIMPLE_STEP * flash.chunks.len(),
        true,
        |_| uds_steps::erase(&channels[index], can_id, flash),
    );
    runner.step(FlasherState::WriteFlash, progress_of(flash), true, |progress| {
        uds_steps::transfer_data(&channels[index], can_id, flash, progress)
    });
    runner.step(FlasherState::WakeUp, SIMPLE_STEP, false, |_| {
        if let Some(id) = keepalive.take() {
            channels[index].stop_periodic_all(&[id]);
        }
        uds_steps::wake_up(&channels);
        Ok(())
    });
    runner.step(FlasherState::CloseChannels, SIMPLE_STEP, false, |_| {
        channels.clear();
        Ok(())
    });
    runner.finish();
    info!("UDS flash finished");
    Ok(())
}

fn run_d2_flash(shared: &Shared) -> Result<()> {
    let params = &shared.params;
    let sbl = params
        .sbl_provider
        .sbl(params.platform, params.ecu_id, &params.extra_info)
        .ok_or_else(|| Error::flash("secondary bootloader not found"))?;
    if sbl.chunks.is_empty() {
        return Err(Error::flash("secondary bootloader is empty"));
    }
    let flash = &params.flash;
    shared.set_max_progress(SIMPLE_STEP * 6 + progress_of(&sbl) + progress_of(flash));

    let mut runner = StepRunner::new(shared);
    let mut channels: Vec<Channel> = Vec::new();
    runner.step(FlasherState::OpenChannels, SIMPLE_STEP, true, |_| {
        channels = config::open_all_channels(&shared.device, params.platform, params.ecu_id)?;
        Ok(())
    });
    if channels.is_empty() {
        runner.finish();
        return Ok(());
    }
    let index = config::channel_index_for_ecu(params.platform, params.ecu_id)?;

    runner.step(FlasherState::WakeUp, SIMPLE_STEP, true, |_| {
        d2_steps::wake_up(&channels);
        Ok(())
    });
    runner.step(FlasherState::FallAsleep, SIMPLE_STEP, true, |_| {
        d2_steps::fall_asleep(&channels)?;
        d2_steps::start_pbl(&channels[index], params.ecu_id)
    });
    runner.step(FlasherState::LoadBootloader, progress_of(&sbl), true, |progress| {
        d2_steps::transfer_data(&channels[index], params.ecu_id, &sbl, progress)
    });
    runner.step(FlasherState::StartBootloader, SIMPLE_STEP, true, |_| {
        d2_steps::start_routine(&channels[index], params.ecu_id, sbl.header.call)
    });
    runner.step(FlasherState::EraseFlash, SIMPLE_STEP, true, |_| {
        d2_steps::erase(&channels[index], params.ecu_id, flash)
    });
    runner.step(FlasherState::WriteFlash, progress_of(flash), true, |progress| {
        d2_steps::transfer_data(&channels[index], params.ecu_id, flash, progress)
    });
    runner.step(FlasherState::WakeUp, SIMPLE_STEP, false, |_| {
        d2_steps::wake_up(&channels);
        std::thread::sleep(std::time::Duration::from_secs(2));
        if let Some((hours, minutes)) = params.clock {
            d2_steps::set_dim_time(&channels, hours, minutes);
        }
        Ok(())
    });
    runner.finish();
    info!("D2 flash finished");
    Ok(())
}

fn run_d2_read(shared: &Shared, start: u32, size: u32) -> Result<()> {
    let params = &shared.params;
    shared.set_max_progress(SIMPLE_STEP * 3 + size as usize);

    let mut runner = StepRunner::new(shared);
    let mut channels: Vec<Channel> = Vec::new();
    runner.step(FlasherState::OpenChannels, SIMPLE_STEP, true, |_| {
        channels = config::open_all_channels(&shared.device, params.platform, params.ecu_id)?;
        Ok(())
    });
    if channels.is_empty() {
        runner.finish();
        return Ok(());
    }
    let index = config::channel_index_for_ecu(params.platform, params.ecu_id)?;

    runner.step(FlasherState::FallAsleep, SIMPLE_STEP, true, |_| {
        d2_steps::wake_up(&channels);
        d2_steps::fall_asleep(&channels)
    });
    runner.step(FlasherState::ReadFlash, size as usize, true, |progress| {
        let data =
            d2_steps::read_memory(&channels[index], params.ecu_id, start, size, progress)?;
        *shared.read_data.lock().unwrap() = Some(data);
        Ok(())
    });
    runner.step(FlasherState::WakeUp, SIMPLE_STEP, false, |_| {
        d2_steps::wake_up(&channels);
        Ok(())
    });
    runner.finish();
    info!("D2 read finished");
    Ok(())
}

fn run_kwp_flash(shared: &Shared) -> Result<()> {
    let params = &shared.params;
    let (bus, ecu) = config::ecu_info(params.platform, params.ecu_id)?;
    let flash = &params.flash;
    shared.set_max_progress(SIMPLE_STEP * 5 + progress_of(flash));

    let mut runner = StepRunner::new(shared);
    let mut channels: Vec<Channel> = Vec::new();
    runner.step(FlasherState::OpenChannels, SIMPLE_STEP, true, |_| {
        channels = config::open_all_channels(&shared.device, params.platform, params.ecu_id)?;
        Ok(())
    });
    if channels.is_empty() {
        runner.finish();
        return Ok(());
    }
    let index = config::channel_index_for_ecu(params.platform, params.ecu_id)?;

    // The request processor depends on the bus: TP 2.0 session on raw
    // CAN, plain UDS framing on ISO-TP.
    let mut session;
    let mut uds_proc;
    let mut tp20_proc;
    let processor: &mut dyn RequestProcessor = match bus.protocol {
        crate::adapter::Protocol::IsoTp => {
            uds_proc = UdsProcessor::new(&channels[index], ecu.can_id);
            &mut uds_proc
        }
        _ => {
            session = Tp20Session::new(&channels[index], params.platform, params.ecu_id);
            session.start()?;
            tp20_proc = Tp20Processor::new(&mut session);
            &mut tp20_proc
        }
    };

    runner.step(FlasherState::Authorize, SIMPLE_STEP, true, |_| {
        kwp_steps::authorize(processor)
    });
    runner.step(FlasherState::ProgrammingSession, SIMPLE_STEP, true, |_| {
        kwp_steps::enter_programming_session(processor)
    });
    runner.step(FlasherState::EraseFlash, SIMPLE_STEP, true, |_| {
        kwp_steps::erase(processor, flash)
    });
    runner.step(FlasherState::WriteFlash, progress_of(flash), true, |progress| {
        kwp_steps::transfer_data(processor, flash, progress)
    });
    runner.step(FlasherState::CloseChannels, SIMPLE_STEP, false, |_| {
        processor.disconnect()?;
        Ok(())
    });
    runner.finish();
    info!("KWP flash finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert_ne!(FlasherState::Done, FlasherState::Error);
    }
}

/*! Telemetry logger: sample registered measurement parameters on a
fixed 50 ms grid and dispatch decoded records to subscribers.

Two threads per logger. The sampler blocks on channel I/O and waits on
an absolute time grid anchored at the session epoch, so the cadence
does not drift with per-sample latency; missed slots are skipped, not
buffered. The dispatcher drains a bounded in-process queue, applies
each parameter's transform and fires the subscriber callbacks, keeping
slow subscribers out of the sampling path.

Three read primitives exist: the D2 register-and-poll dialogue, UDS
dynamically-defined data identifiers (DDDIs), and a slow per-parameter
`0x23` read for ECUs that reject DDDIs.
*/
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::adapter::{Channel, Device, ReadStep};
use crate::config::{self, CarPlatform};
use crate::d2::{self, D2Request, messages};
use crate::params::LogParameters;
use crate::uds::UdsRequest;
use crate::{Error, Result, be32};

/// Sampling grid interval.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// First dynamically-defined data identifier the UDS backend claims.
const DDDI_BASE: u16 = 0xF200;
/// Payload capacity of one DDDI.
const DDDI_MAX_BYTES: usize = 7;

/// One raw sample record: milliseconds since the session epoch plus
/// one undecoded value per parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Milliseconds since logging started.
    pub timestamp_ms: u64,
    /// Raw values, one per parameter, in sheet order.
    pub values: Vec<u32>,
}

/// Subscriber to a running logger. Fired on the dispatcher thread;
/// must not block and must not call back into the logger.
pub trait LoggerCallback: Send + Sync {
    /// Logging started (`true`) or stopped (`false`).
    fn on_status_changed(&self, _started: bool) {}
    /// One decoded record.
    fn on_record(&self, _timestamp_ms: u64, _values: &[f64]) {}
}

#[derive(Debug)]
struct DidGroup {
    did: u16,
    param_indexes: Vec<usize>,
    free: usize,
}

enum Backend {
    D2,
    UdsDddi { can_id: u32, groups: Vec<DidGroup> },
    UdsSlow { can_id: u32 },
}

impl Backend {
    fn for_platform(platform: CarPlatform, ecu_id: u8) -> Result<Self> {
        use CarPlatform::*;
        match platform {
            P80 | P1 | P2 | P2_250 if ecu_id == d2::EcuKind::EcmMe as u8 => Ok(Backend::D2),
            P3 | Spa | Ford | Vag => {
                let (_, ecu) = config::ecu_info(platform, ecu_id)?;
                Ok(Backend::UdsDddi { can_id: ecu.can_id, groups: Vec::new() })
            }
            Haval => {
                let (_, ecu) = config::ecu_info(platform, ecu_id)?;
                Ok(Backend::UdsSlow { can_id: ecu.can_id })
            }
            _ => Err(Error::invalid(format!(
                "no logger backend for ECU 0x{ecu_id:02X} on {platform:?}"
            ))),
        }
    }

    fn register(&mut self, channel: &Channel, params: &LogParameters) -> Result<()> {
        match self {
            Backend::D2 => {
                D2Request::from_message(messages::unregister_all()).process(channel, 3000)?;
                for param in params.parameters() {
                    D2Request::from_message(messages::register_addr(param.addr(), param.size()))
                        .process(channel, 3000)?;
                }
                Ok(())
            }
            Backend::UdsDddi { can_id, groups } => {
                UdsRequest::new(*can_id, vec![0x10, 0x03])?.process(channel, 3000)?;
                *groups = pack_dids(params);
                for group in groups.iter() {
                    let did = group.did.to_be_bytes();
                    UdsRequest::new(*can_id, vec![0x2C, 0x03, did[0], did[1]])?
                        .process(channel, 3000)?;
                    // 0x24: four address bytes, two size bytes per entry.
                    let mut register = vec![0x2C, 0x02, did[0], did[1], 0x24];
                    for &index in &group.param_indexes {
                        let param = &params.parameters()[index];
                        register.extend_from_slice(&be32(param.addr()));
                        register.extend_from_slice(&(param.size() as u16).to_be_bytes());
                    }
                    UdsRequest::new(*can_id, register)?.process(channel, 3000)?;
                }
                Ok(())
            }
            Backend::UdsSlow { can_id } => {
                UdsRequest::new(*can_id, vec![0x10, 0x03])?.process(channel, 3000)?;
                Ok(())
            }
        }
    }

    fn sample(&self, channel: &Channel, params: &LogParameters) -> Result<Vec<u32>> {
        match self {
            Backend::D2 => sample_d2(channel, params),
            Backend::UdsDddi { can_id, groups } => sample_dddi(channel, *can_id, groups, params),
            Backend::UdsSlow { can_id } => sample_slow(channel, *can_id, params),
        }
    }
}

/// Greedy first-fit packing of parameters into 7-byte DDDIs.
fn pack_dids(params: &LogParameters) -> Vec<DidGroup> {
    let mut groups: Vec<DidGroup> = Vec::new();
    for (index, param) in params.parameters().iter().enumerate() {
        let slot = match groups.iter_mut().find(|g| g.free >= param.size()) {
            Some(group) => group,
            None => {
                let did = groups.iter().map(|g| g.did).max().unwrap_or(DDDI_BASE - 1) + 1;
                groups.push(DidGroup { did, param_indexes: Vec::new(), free: DDDI_MAX_BYTES });
                groups.last_mut().unwrap()
            }
        };
        slot.param_indexes.push(index);
        slot.free -= param.size();
    }
    groups
}

fn sample_d2(channel: &Channel, params: &LogParameters) -> Result<Vec<u32>> {
    let frame_count = params.can_message_count();
    let param_count = params.parameters().len();
    channel.send(&messages::request_memory(), 3000)?;
    let mut result = Vec::with_capacity(param_count);
    let mut frames_seen = 0usize;
    let mut param_index = 0usize;
    let mut param_offset = 0usize;
    let mut value: u32 = 0;
    channel.read_with(3000, |frame| {
        let data = frame.raw();
        // The first frame of a record echoes the read-by-identifier
        // answer E6 F0 00 behind the series marker.
        let mut offset = 5usize;
        if data.len() > 8
            && data[4] == 0x8F
            && data[5] == d2::EcuKind::EcmMe as u8
            && data[6] == 0xE6
            && data[7] == 0xF0
            && data[8] == 0
        {
            offset = 9;
        }
        for i in offset..12.min(data.len()) {
            if param_index >= param_count {
                break;
            }
            let param = &params.parameters()[param_index];
            value += u32::from(data[i]) << ((param.size() - param_offset - 1) * 8);
            param_offset += 1;
            if param_offset >= param.size() {
                result.push(value);
                param_index += 1;
                param_offset = 0;
                value = 0;
            }
        }
        frames_seen += 1;
        Ok(if frames_seen < frame_count && param_index < param_count {
            ReadStep::Continue
        } else {
            ReadStep::Done
        })
    })?;
    if result.len() != param_count {
        return Err(Error::frame("incomplete measurement record"));
    }
    Ok(result)
}

fn sample_dddi(
    channel: &Channel,
    can_id: u32,
    groups: &[DidGroup],
    params: &LogParameters,
) -> Result<Vec<u32>> {
    let mut result = vec![0u32; params.parameters().len()];
    for group in groups {
        let did = group.did.to_be_bytes();
        let data =
            UdsRequest::new(can_id, vec![0x22, did[0], did[1]])?.process(channel, 3000)?;
        let mut group_index = 0usize;
        let mut param_offset = 0usize;
        let mut value: u32 = 0;
        for &byte in data.iter().skip(7) {
            if group_index >= group.param_indexes.len() {
                break;
            }
            let param_index = group.param_indexes[group_index];
            let param = &params.parameters()[param_index];
            value += u32::from(byte) << ((param.size() - param_offset - 1) * 8);
            param_offset += 1;
            if param_offset >= param.size() {
                result[param_index] = value;
                group_index += 1;
                param_offset = 0;
                value = 0;
            }
        }
        if group_index < group.param_indexes.len() {
            return Err(Error::frame("short DDDI record"));
        }
    }
    Ok(result)
}

fn sample_slow(channel: &Channel, can_id: u32, params: &LogParameters) -> Result<Vec<u32>> {
    let mut result = vec![0u32; params.parameters().len()];
    for (index, param) in params.parameters().iter().enumerate() {
        // 0x14: four address bytes, one size byte.
        let mut request = vec![0x23, 0x14];
        request.extend_from_slice(&be32(param.addr()));
        request.push(param.size() as u8);
        match UdsRequest::new(can_id, request)?.process(channel, 3000) {
            Ok(data) => {
                let mut value: u32 = 0;
                for (offset, &byte) in data.iter().skip(5).take(param.size()).enumerate() {
                    value += u32::from(byte) << (offset * 8);
                }
                result[index] = value;
            }
            Err(e) => debug!("slow read of {} failed: {e}", param.name()),
        }
    }
    Ok(result)
}

struct LoggerShared {
    params: Mutex<LogParameters>,
    stopped: Mutex<bool>,
    stop_cond: Condvar,
    queue: Mutex<VecDeque<LogRecord>>,
    queue_cond: Condvar,
    callbacks: Mutex<Vec<Arc<dyn LoggerCallback>>>,
    running: AtomicBool,
}

impl LoggerShared {
    fn snapshot_callbacks(&self) -> Vec<Arc<dyn LoggerCallback>> {
        self.callbacks.lock().unwrap().clone()
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap()
    }
}

/// A measurement logger for one ECU.
pub struct Logger {
    device: Device,
    platform: CarPlatform,
    ecu_id: u8,
    shared: Arc<LoggerShared>,
    sampler: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Logger {
    /// Create a logger; fails if no backend exists for the ECU.
    pub fn new(device: Device, platform: CarPlatform, ecu_id: u8) -> Result<Self> {
        // Probe the backend now so a bad combination fails loudly.
        Backend::for_platform(platform, ecu_id)?;
        Ok(Self {
            device,
            platform,
            ecu_id,
            shared: Arc::new(LoggerShared {
                params: Mutex::new(LogParameters::default()),
                stopped: Mutex::new(true),
                stop_cond: Condvar::new(),
                queue: Mutex::new(VecDeque::new()),
                queue_cond: Condvar::new(),
                callbacks: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
            }),
            sampler: None,
            dispatcher: None,
        })
    }

    /// Subscribe. May be called from any thread, also while running.
    pub fn register_callback(&self, callback: Arc<dyn LoggerCallback>) {
        self.shared.callbacks.lock().unwrap().push(callback);
    }

    /// Register the parameters with the ECU and start the sampler and
    /// dispatcher threads.
    pub fn start(&mut self, parameters: LogParameters) -> Result<()> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid("logging already started"));
        }
        let setup: Result<(Channel, Backend)> = (|| {
            let channel =
                config::open_channel_for_ecu(&self.device, self.platform, self.ecu_id)?;
            let mut backend = Backend::for_platform(self.platform, self.ecu_id)?;
            backend.register(&channel, &parameters)?;
            Ok((channel, backend))
        })();
        let (channel, backend) = match setup {
            Ok(pair) => pair,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.shared.params.lock().unwrap() = parameters;
        *self.shared.stopped.lock().unwrap() = false;

        let shared = Arc::clone(&self.shared);
        self.sampler = Some(
            thread::Builder::new()
                .name("log-sampler".to_string())
                .spawn(move || sampler_loop(&shared, channel, backend))
                .map_err(|e| Error::invalid(format!("cannot spawn sampler: {e}")))?,
        );
        let shared = Arc::clone(&self.shared);
        self.dispatcher = Some(
            thread::Builder::new()
                .name("log-dispatcher".to_string())
                .spawn(move || dispatcher_loop(&shared))
                .map_err(|e| Error::invalid(format!("cannot spawn dispatcher: {e}")))?,
        );
        Ok(())
    }

    /// Stop both threads and wait for them.
    pub fn stop(&mut self) {
        {
            let mut stopped = self.shared.stopped.lock().unwrap();
            *stopped = true;
            self.shared.stop_cond.notify_all();
        }
        {
            // Wake the dispatcher under its own mutex so the signal
            // cannot fall between its stop check and its wait.
            let _queue = self.shared.queue.lock().unwrap();
            self.shared.queue_cond.notify_all();
        }
        if let Some(handle) = self.sampler.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sampler_loop(shared: &LoggerShared, channel: Channel, backend: Backend) {
    for cb in shared.snapshot_callbacks() {
        cb.on_status_changed(true);
    }
    let params = shared.params.lock().unwrap().clone();
    let epoch = Instant::now();
    let mut slot: u64 = 0;
    loop {
        if shared.is_stopped() {
            break;
        }
        let _ = channel.clear_rx();
        let _ = channel.clear_tx();
        match backend.sample(&channel, &params) {
            Ok(values) => {
                let timestamp_ms = epoch.elapsed().as_millis() as u64;
                let mut queue = shared.queue.lock().unwrap();
                queue.push_back(LogRecord { timestamp_ms, values });
                shared.queue_cond.notify_all();
            }
            Err(e) => warn!("sample failed: {e}"),
        }
        // Advance along the absolute grid; skip slots we already
        // missed rather than burst-firing to catch up.
        slot += 1;
        let mut target = epoch + SAMPLE_INTERVAL * slot as u32;
        let now = Instant::now();
        while target <= now {
            slot += 1;
            target = epoch + SAMPLE_INTERVAL * slot as u32;
        }
        let stopped = shared.stopped.lock().unwrap();
        let _unused = shared
            .stop_cond
            .wait_timeout(stopped, target.duration_since(now))
            .unwrap();
    }
    for cb in shared.snapshot_callbacks() {
        cb.on_status_changed(false);
    }
}

fn dispatcher_loop(shared: &LoggerShared) {
    let params = shared.params.lock().unwrap().clone();
    loop {
        let record = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if shared.is_stopped() {
                    return;
                }
                if let Some(record) = queue.pop_front() {
                    break record;
                }
                queue = shared.queue_cond.wait(queue).unwrap();
            }
        };
        let formatted: Vec<f64> = record
            .values
            .iter()
            .zip(params.parameters())
            .map(|(&raw, param)| param.format_value(raw))
            .collect();
        for cb in shared.snapshot_callbacks() {
            cb.on_record(record.timestamp_ms, &formatted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{DataType, LogParameter};

    fn params(sizes: &[usize]) -> LogParameters {
        LogParameters::new(
            sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| {
                    LogParameter::new(
                        &format!("p{i}"),
                        0x1000 + i as u32,
                        size,
                        DataType::Int,
                        0,
                        "",
                        false,
                        false,
                        1.0,
                        0.0,
                        "",
                    )
                    .unwrap()
                })
                .collect(),
        )
    }

    #[test]
    fn did_packing_respects_capacity() {
        let groups = pack_dids(&params(&[4, 4, 2, 1, 1]));
        // 4+2+1 fills the first DID, 4+1 lands in the second.
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].did, 0xF200);
        assert_eq!(groups[1].did, 0xF201);
        assert_eq!(groups[0].param_indexes, vec![0, 2, 3]);
        assert_eq!(groups[1].param_indexes, vec![1, 4]);
        assert_eq!(groups[0].free, 0);
        assert_eq!(groups[1].free, 2);
    }

    #[test]
    fn backend_selection() {
        assert!(matches!(
            Backend::for_platform(CarPlatform::P2, 0x7A),
            Ok(Backend::D2)
        ));
        assert!(matches!(
            Backend::for_platform(CarPlatform::P3, 0x10),
            Ok(Backend::UdsDddi { can_id: 0x7E0, .. })
        ));
        assert!(matches!(
            Backend::for_platform(CarPlatform::Haval, 0x10),
            Ok(Backend::UdsSlow { can_id: 0x7E0 })
        ));
        assert!(Backend::for_platform(CarPlatform::P2, 0x51).is_err());
    }
}

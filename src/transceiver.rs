/*! Standalone CAN message transceiver: one reader thread that
reassembles D2 frame series per sender and dispatches complete
messages to subscribers.

Used by tooling that wants to observe bus traffic without driving a
request/response dialogue (and by the `test` CLI mode). Subscribers are
fired from the reader thread with a copy-on-notify snapshot, so they
may be added or removed from any thread, but must not block.
*/
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use log::{trace, warn};

use crate::adapter::{Channel, Message, ReadStep};
use crate::d2::{EcuKind, SeriesDecoder, ecu_kind_from_prefix};
use crate::{Error, Result};

/// Receiver of reassembled messages. Fired on the reader thread.
pub trait CanSubscriber: Send + Sync {
    /// One complete message from `ecu`.
    fn on_message(&self, ecu: EcuKind, payload: &[u8]);
}

struct Shared {
    channel: Channel,
    enabled: Mutex<bool>,
    shutdown: Mutex<bool>,
    wakeup: Condvar,
    subscribers: Mutex<Vec<(EcuKind, Arc<dyn CanSubscriber>)>>,
}

/// Owns one channel and the reader thread on it.
pub struct CanTransceiver {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl CanTransceiver {
    /// Take ownership of a channel and start the (initially paused)
    /// reader thread.
    pub fn new(channel: Channel) -> Result<Self> {
        let shared = Arc::new(Shared {
            channel,
            enabled: Mutex::new(false),
            shutdown: Mutex::new(false),
            wakeup: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
        });
        let thread_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name("can-transceiver".to_string())
            .spawn(move || reader_loop(&thread_shared))
            .map_err(|e| Error::invalid(format!("cannot spawn reader thread: {e}")))?;
        Ok(Self { shared, reader: Some(reader) })
    }

    /// Subscribe to messages from one ECU.
    pub fn subscribe(&self, ecu: EcuKind, subscriber: Arc<dyn CanSubscriber>) {
        self.shared.subscribers.lock().unwrap().push((ecu, subscriber));
    }

    /// Drop every subscription of `subscriber`.
    pub fn unsubscribe_all(&self, subscriber: &Arc<dyn CanSubscriber>) {
        self.shared
            .subscribers
            .lock()
            .unwrap()
            .retain(|(_, s)| !Arc::ptr_eq(s, subscriber));
    }

    /// Pause or resume reading.
    pub fn run_read(&self, enabled: bool) {
        *self.shared.enabled.lock().unwrap() = enabled;
        self.shared.wakeup.notify_all();
    }

    /// Write a message on the owned channel.
    pub fn send(&self, message: &dyn Message) -> Result<()> {
        self.shared.channel.send(message, 5000)?;
        Ok(())
    }
}

impl Drop for CanTransceiver {
    fn drop(&mut self) {
        *self.shared.shutdown.lock().unwrap() = true;
        self.shared.wakeup.notify_all();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn reader_loop(shared: &Shared) {
    let mut partial: HashMap<u8, SeriesDecoder> = HashMap::new();
    loop {
        {
            let mut enabled = shared.enabled.lock().unwrap();
            loop {
                if *shared.shutdown.lock().unwrap() {
                    return;
                }
                if *enabled {
                    break;
                }
                enabled = shared.wakeup.wait(enabled).unwrap();
            }
        }
        let frames = match shared.channel.read(1, 1000) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("transceiver read failed: {e}");
                continue;
            }
        };
        for frame in &frames {
            let raw = frame.raw();
            if raw.len() < 5 {
                continue;
            }
            let ecu = ecu_kind_from_prefix(raw);
            let decoder = partial.entry(ecu as u8).or_default();
            match decoder.feed(&raw[4..]) {
                Ok(ReadStep::Done) => {
                    let decoder = partial.remove(&(ecu as u8)).unwrap_or_default();
                    let payload = decoder.into_data();
                    trace!("message from {ecu:?}: {payload:02x?}");
                    let subscribers = shared.subscribers.lock().unwrap().clone();
                    for (wanted, subscriber) in subscribers {
                        if wanted == ecu {
                            subscriber.on_message(ecu, &payload);
                        }
                    }
                }
                Ok(ReadStep::Continue) => {}
                Err(e) => {
                    trace!("dropping partial message from {ecu:?}: {e}");
                    partial.remove(&(ecu as u8));
                }
            }
        }
    }
}

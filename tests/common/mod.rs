//! Scripted pass-through stub shared by the scenario tests.
//!
//! A test provides a responder closure playing the ECU side: it sees
//! every written frame and returns the frames the "bus" should deliver
//! back on that channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use candiag::adapter::{
    AdapterError, CanFrame, ChannelId, ConfigParam, FilterId, FilterKind, Ioctl, PassThru,
    PeriodicId, Protocol,
};

type Responder = Box<dyn FnMut(ChannelId, &CanFrame) -> Vec<CanFrame> + Send>;

struct State {
    responder: Responder,
    queues: HashMap<ChannelId, VecDeque<CanFrame>>,
    writes: Vec<(ChannelId, CanFrame)>,
    periodics: Vec<(ChannelId, CanFrame, u32)>,
    next: u32,
}

pub struct StubDriver {
    state: Mutex<State>,
}

impl StubDriver {
    pub fn new(
        responder: impl FnMut(ChannelId, &CanFrame) -> Vec<CanFrame> + Send + 'static,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                responder: Box::new(responder),
                queues: HashMap::new(),
                writes: Vec::new(),
                periodics: Vec::new(),
                next: 0,
            }),
        }
    }

    /// Every explicitly written frame, in order.
    #[allow(dead_code)]
    pub fn writes(&self) -> Vec<(ChannelId, CanFrame)> {
        self.state.lock().unwrap().writes.clone()
    }

    /// Every periodic message started, with its interval.
    #[allow(dead_code)]
    pub fn periodics(&self) -> Vec<(ChannelId, CanFrame, u32)> {
        self.state.lock().unwrap().periodics.clone()
    }
}

impl PassThru for StubDriver {
    fn connect(&self, _: Protocol, _: u32, _: u32) -> Result<ChannelId, AdapterError> {
        let mut state = self.state.lock().unwrap();
        state.next += 1;
        let id = state.next;
        state.queues.insert(id, VecDeque::new());
        Ok(id)
    }

    fn disconnect(&self, channel: ChannelId) -> Result<(), AdapterError> {
        self.state.lock().unwrap().queues.remove(&channel);
        Ok(())
    }

    fn read_msgs(
        &self,
        channel: ChannelId,
        max: usize,
        _timeout_ms: u32,
    ) -> Result<Vec<CanFrame>, AdapterError> {
        let mut state = self.state.lock().unwrap();
        let queue = state
            .queues
            .get_mut(&channel)
            .ok_or(AdapterError::DeviceNotConnected)?;
        let take = max.min(queue.len());
        let frames: Vec<CanFrame> = queue.drain(..take).collect();
        drop(state);
        if frames.is_empty() {
            // Keep timed-out polls from spinning hot.
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(frames)
    }

    fn write_msgs(
        &self,
        channel: ChannelId,
        frames: &[CanFrame],
        _timeout_ms: u32,
    ) -> Result<usize, AdapterError> {
        let mut state = self.state.lock().unwrap();
        for frame in frames {
            state.writes.push((channel, frame.clone()));
            let responses = (state.responder)(channel, frame);
            state.queues.entry(channel).or_default().extend(responses);
        }
        Ok(frames.len())
    }

    fn start_periodic(
        &self,
        channel: ChannelId,
        frame: &CanFrame,
        interval_ms: u32,
    ) -> Result<PeriodicId, AdapterError> {
        let mut state = self.state.lock().unwrap();
        state.next += 1;
        let id = state.next;
        state.periodics.push((channel, frame.clone(), interval_ms));
        Ok(id)
    }

    fn stop_periodic(&self, _: ChannelId, _: PeriodicId) -> Result<(), AdapterError> {
        Ok(())
    }

    fn start_filter(
        &self,
        _: ChannelId,
        _: FilterKind,
        _: &CanFrame,
        _: &CanFrame,
        _: Option<&CanFrame>,
    ) -> Result<FilterId, AdapterError> {
        let mut state = self.state.lock().unwrap();
        state.next += 1;
        Ok(state.next)
    }

    fn stop_filter(&self, _: ChannelId, _: FilterId) -> Result<(), AdapterError> {
        Ok(())
    }

    fn ioctl(&self, channel: ChannelId, request: &Ioctl) -> Result<(), AdapterError> {
        if let Ioctl::ClearRxBuffer = request {
            if let Some(queue) = self.state.lock().unwrap().queues.get_mut(&channel) {
                queue.clear();
            }
        }
        Ok(())
    }

    fn set_config(&self, _: ChannelId, _: &[(ConfigParam, u32)]) -> Result<(), AdapterError> {
        Ok(())
    }
}

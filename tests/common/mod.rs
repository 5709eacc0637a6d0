//! Shared test utilities: in-memory connector and audio devices

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use live_mentor::codec::{AudioBuffer, encode_i16};
use live_mentor::config::AudioConfig;
use live_mentor::live::{Connection, ConnectionPeer, Connector, Setup};
use live_mentor::voice::{AudioInput, AudioOutput, BufferId, InputStream, OutputDevice};
use live_mentor::{Error, Result, Session, SessionConfig};

/// Playback rate used by the fakes
pub const OUTPUT_RATE: u32 = 24000;

/// Connector that hands out in-memory connections
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub setups: Arc<Mutex<Vec<Setup>>>,
    pub peer: Arc<Mutex<Option<ConnectionPeer>>>,
    pub fail: bool,
}

impl FakeConnector {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Transport side of the last connection
    pub fn take_peer(&self) -> ConnectionPeer {
        self.peer
            .lock()
            .unwrap()
            .take()
            .expect("no connection was opened")
    }
}

#[async_trait(?Send)]
impl Connector for FakeConnector {
    async fn connect(&self, setup: &Setup) -> Result<Connection> {
        self.setups.lock().unwrap().push(setup.clone());
        if self.fail {
            return Err(Error::Connection("endpoint unreachable".to_string()));
        }
        let (connection, peer) = Connection::channel();
        *self.peer.lock().unwrap() = Some(peer);
        Ok(connection)
    }
}

#[derive(Default)]
pub struct InputState {
    pub opened: usize,
    pub released: usize,
    pub sink: Option<mpsc::UnboundedSender<Vec<f32>>>,
}

/// Microphone whose frames are pushed by the test
#[derive(Clone, Default)]
pub struct FakeInput {
    pub state: Arc<Mutex<InputState>>,
    pub deny: bool,
}

impl FakeInput {
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.state.lock().unwrap().sink.is_some()
    }

    /// Deliver a captured frame; false if capture is not running
    pub fn push(&self, frame: Vec<f32>) -> bool {
        self.state
            .lock()
            .unwrap()
            .sink
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok())
    }

    /// Streams opened and not yet released
    pub fn open_streams(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.opened - state.released
    }
}

impl AudioInput for FakeInput {
    fn open(&self, _sample_rate: u32, _frame_size: usize) -> Result<Box<dyn InputStream>> {
        if self.deny {
            return Err(Error::Permission("microphone access denied".to_string()));
        }
        self.state.lock().unwrap().opened += 1;
        Ok(Box::new(FakeInputStream {
            state: Arc::clone(&self.state),
            stopped: false,
        }))
    }
}

struct FakeInputStream {
    state: Arc<Mutex<InputState>>,
    stopped: bool,
}

impl InputStream for FakeInputStream {
    fn start(&mut self, frames: mpsc::UnboundedSender<Vec<f32>>) -> Result<()> {
        self.state.lock().unwrap().sink = Some(frames);
        Ok(())
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            let mut state = self.state.lock().unwrap();
            state.sink = None;
            state.released += 1;
        }
    }
}

#[derive(Default)]
pub struct OutputState {
    pub clock: f64,
    pub next_id: BufferId,
    pub opened: usize,
    pub closed: usize,
    /// (id, start, duration) in schedule order
    pub scheduled: Vec<(BufferId, f64, f64)>,
    pub stopped: Vec<BufferId>,
    pub completions: Option<mpsc::UnboundedSender<BufferId>>,
}

/// Speaker with a manually driven clock
#[derive(Clone, Default)]
pub struct FakeOutput {
    pub state: Arc<Mutex<OutputState>>,
}

impl FakeOutput {
    pub fn set_clock(&self, seconds: f64) {
        self.state.lock().unwrap().clock = seconds;
    }

    /// Report a buffer as finished playing
    pub fn finish(&self, id: BufferId) {
        if let Some(tx) = self.state.lock().unwrap().completions.as_ref() {
            let _ = tx.send(id);
        }
    }

    pub fn stopped(&self) -> Vec<BufferId> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn starts(&self) -> Vec<f64> {
        self.state
            .lock()
            .unwrap()
            .scheduled
            .iter()
            .map(|(_, start, _)| *start)
            .collect()
    }

    /// Devices opened and not yet closed
    pub fn open_devices(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.opened - state.closed
    }
}

impl AudioOutput for FakeOutput {
    fn open(
        &self,
        _sample_rate: u32,
        completions: mpsc::UnboundedSender<BufferId>,
    ) -> Result<Box<dyn OutputDevice>> {
        let mut state = self.state.lock().unwrap();
        state.opened += 1;
        state.completions = Some(completions);
        Ok(Box::new(FakeDevice {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

struct FakeDevice {
    state: Arc<Mutex<OutputState>>,
    closed: bool,
}

impl OutputDevice for FakeDevice {
    fn now(&self) -> f64 {
        self.state.lock().unwrap().clock
    }

    fn schedule(&mut self, buffer: AudioBuffer, start_at: f64) -> Result<BufferId> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.scheduled.push((id, start_at, buffer.duration()));
        Ok(id)
    }

    fn stop(&mut self, id: BufferId) {
        self.state.lock().unwrap().stopped.push(id);
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().unwrap().closed += 1;
        }
    }
}

/// A session wired to fakes, with handles to inspect them
pub struct Harness {
    pub session: Session,
    pub connector: FakeConnector,
    pub input: FakeInput,
    pub output: FakeOutput,
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        model: "test-model".to_string(),
        voice: "Puck".to_string(),
        system_instruction: "Be a mentor.".to_string(),
        audio: AudioConfig::default(),
    }
}

pub fn harness_with(connector: FakeConnector, input: FakeInput) -> Harness {
    build_harness(session_config(), connector, input)
}

pub fn harness_with_config(config: SessionConfig) -> Harness {
    build_harness(config, FakeConnector::default(), FakeInput::default())
}

fn build_harness(config: SessionConfig, connector: FakeConnector, input: FakeInput) -> Harness {
    let output = FakeOutput::default();
    let session = Session::new(
        config,
        Box::new(connector.clone()),
        Box::new(input.clone()),
        Box::new(output.clone()),
    );
    Harness {
        session,
        connector,
        input,
        output,
    }
}

pub fn harness() -> Harness {
    harness_with(FakeConnector::default(), FakeInput::default())
}

/// Base64 payload of `millis` of silence at the output rate
pub fn silence_payload(millis: u32) -> String {
    let samples = (OUTPUT_RATE / 1000 * millis) as usize;
    encode_i16(&vec![0; samples])
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {expected}, got {actual}"
    );
}

//! Realtime voice session
//!
//! One [`Session`] owns one conversation: the connection, the microphone
//! stream, the output device, the playback cursor and the set of buffers
//! still scheduled. Every event is dispatched from [`Session::step`], so
//! cursor and tracked-set updates never interleave.
//!
//! ```text
//! Idle ──start()──▶ Connecting ──Open──▶ Open ──close/error──▶ Closed
//!                        └────────────── error ─────────────────▲
//! ```

use std::collections::HashMap;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::protocol::{ClientMessage, ServerEvent, Setup};
use super::transport::{CLOSE_TIMEOUT, Connection, Connector, NORMAL_CLOSURE, TransportEvent};
use crate::codec;
use crate::config::AudioConfig;
use crate::voice::{AudioInput, AudioOutput, BufferId, InputStream, OutputDevice};
use crate::{Error, Result};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    /// Terminal
    Closed,
}

/// Observable session status for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// True strictly between open and close/error
    pub active: bool,
    /// Last fatal error, if any
    pub last_error: Option<String>,
    /// Inbound frames dropped because they failed to decode
    pub dropped_frames: u64,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            active: false,
            last_error: None,
            dropped_frames: 0,
        }
    }
}

/// Fixed parameters of a conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub audio: AudioConfig,
}

/// A buffer on the output timeline
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledBuffer {
    pub id: BufferId,
    /// Device clock time playback begins, in seconds
    pub start_at: f64,
    /// Length in seconds
    pub duration: f64,
}

/// Requests stopping a running session
#[derive(Debug, Clone)]
pub struct SessionController {
    tx: mpsc::UnboundedSender<()>,
}

impl SessionController {
    /// Ask the session to close; ignored once it is gone
    pub fn stop(&self) {
        let _ = self.tx.send(());
    }
}

enum Step {
    Transport(Option<TransportEvent>),
    Frame(Option<Vec<f32>>),
    Ended(BufferId),
    Stop,
}

/// A single realtime voice conversation
pub struct Session {
    config: SessionConfig,
    connector: Box<dyn Connector>,
    input: Box<dyn AudioInput>,
    output: Box<dyn AudioOutput>,

    state: SessionState,
    connection: Option<Connection>,
    /// I/O task still running the close handshake
    closing: Option<JoinHandle<()>>,
    capture: Option<Box<dyn InputStream>>,
    frames: Option<mpsc::UnboundedReceiver<Vec<f32>>>,
    device: Option<Box<dyn OutputDevice>>,

    cursor: f64,
    scheduled: HashMap<BufferId, ScheduledBuffer>,
    completions_tx: mpsc::UnboundedSender<BufferId>,
    completions: mpsc::UnboundedReceiver<BufferId>,

    control_tx: mpsc::UnboundedSender<()>,
    control: mpsc::UnboundedReceiver<()>,
    status: watch::Sender<SessionStatus>,
}

impl Session {
    #[must_use]
    pub fn new(
        config: SessionConfig,
        connector: Box<dyn Connector>,
        input: Box<dyn AudioInput>,
        output: Box<dyn AudioOutput>,
    ) -> Self {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (control_tx, control) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(SessionStatus::default());

        Self {
            config,
            connector,
            input,
            output,
            state: SessionState::Idle,
            connection: None,
            closing: None,
            capture: None,
            frames: None,
            device: None,
            cursor: 0.0,
            scheduled: HashMap::new(),
            completions_tx,
            completions,
            control_tx,
            control,
            status,
        }
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the connection is open and audio flows
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Device time the next buffer may start at, zero after a reset
    #[must_use]
    pub const fn playback_cursor(&self) -> f64 {
        self.cursor
    }

    /// Buffers scheduled and not yet finished, in start order
    #[must_use]
    pub fn scheduled_buffers(&self) -> Vec<ScheduledBuffer> {
        let mut buffers: Vec<_> = self.scheduled.values().copied().collect();
        buffers.sort_by(|a, b| a.start_at.total_cmp(&b.start_at));
        buffers
    }

    /// Whether any connection, capture or output handle is still held
    #[must_use]
    pub const fn holds_resources(&self) -> bool {
        self.connection.is_some() || self.capture.is_some() || self.device.is_some()
    }

    /// Subscribe to status changes
    #[must_use]
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Current status snapshot
    #[must_use]
    pub fn current_status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Handle for stopping the session from elsewhere
    #[must_use]
    pub fn controller(&self) -> SessionController {
        SessionController {
            tx: self.control_tx.clone(),
        }
    }

    /// Connect to the model and acquire audio devices
    ///
    /// Capture is wired only once the server confirms the session is open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Permission`] if the microphone is refused,
    /// [`Error::Connection`] if the endpoint cannot be reached, or
    /// [`Error::InvalidState`] if the session was already started. Every
    /// acquired resource is released before a failure is returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::InvalidState(format!(
                "start() called in {:?} state",
                self.state
            )));
        }

        self.set_state(SessionState::Connecting);

        match self.acquire().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn acquire(&mut self) -> Result<()> {
        let audio = self.config.audio;

        let device = self
            .output
            .open(audio.output_sample_rate, self.completions_tx.clone())?;
        self.device = Some(device);

        let capture = self.input.open(audio.input_sample_rate, audio.frame_size)?;
        self.capture = Some(capture);

        let setup = Setup::audio(
            &self.config.model,
            &self.config.voice,
            &self.config.system_instruction,
        );

        tracing::info!(
            model = %setup.model,
            voice = %self.config.voice,
            "connecting live session"
        );

        let connection = self.connector.connect(&setup).await.map_err(|e| match e {
            Error::Connection(_) => e,
            other => Error::Connection(other.to_string()),
        })?;
        self.connection = Some(connection);

        Ok(())
    }

    /// Run until the session closes
    ///
    /// Waits for the connection's close handshake before returning.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that ended the session, or
    /// [`Error::InvalidState`] if `start()` has not succeeded
    pub async fn run(&mut self) -> Result<()> {
        if self.state == SessionState::Idle {
            return Err(Error::InvalidState("run() before start()".to_string()));
        }

        let result = loop {
            match self.step().await {
                Ok(true) => {}
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.finish_close().await;
        result
    }

    /// Wait for a closed connection's I/O task to exit
    async fn finish_close(&mut self) {
        let Some(mut task) = self.closing.take() else {
            return;
        };
        if tokio::time::timeout(CLOSE_TIMEOUT * 2, &mut task).await.is_err() {
            tracing::debug!("connection task did not exit, aborting");
            task.abort();
        }
    }

    /// Wait for and dispatch one event
    ///
    /// Returns false once the session is closed.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that closed the session
    pub async fn step(&mut self) -> Result<bool> {
        if self.state == SessionState::Closed {
            return Ok(false);
        }

        let step = tokio::select! {
            event = next_event(self.connection.as_mut()) => Step::Transport(event),
            frame = next_frame(self.frames.as_mut()) => Step::Frame(frame),
            Some(id) = self.completions.recv() => Step::Ended(id),
            _ = self.control.recv() => Step::Stop,
        };

        match step {
            Step::Transport(Some(event)) => self.handle_event(event)?,
            Step::Transport(None) => self.handle_event(TransportEvent::Closed {
                code: None,
                reason: None,
            })?,
            Step::Frame(Some(frame)) => self.send_frame(&frame),
            Step::Frame(None) => {
                tracing::warn!("capture stream ended");
                self.frames = None;
            }
            Step::Ended(id) => self.on_buffer_ended(id),
            Step::Stop => {
                tracing::info!("session stop requested");
                self.close();
            }
        }

        Ok(self.state != SessionState::Closed)
    }

    /// Dispatch one transport event
    ///
    /// # Errors
    ///
    /// Returns the fatal error if the event closed the session
    pub fn handle_event(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Open | TransportEvent::Server(ServerEvent::SetupComplete) => {
                self.on_open()
            }
            TransportEvent::Server(ServerEvent::Audio { data, sample_rate }) => {
                self.on_server_audio(&data, sample_rate);
                Ok(())
            }
            TransportEvent::Server(ServerEvent::Interrupted) => {
                self.on_server_interrupt();
                Ok(())
            }
            TransportEvent::Server(ServerEvent::TurnComplete) => {
                tracing::debug!(scheduled = self.scheduled.len(), "model turn complete");
                Ok(())
            }
            TransportEvent::Server(ServerEvent::GoAway { time_left }) => {
                let error = Error::Connection(format!(
                    "server is ending the session (time left: {})",
                    time_left.as_deref().unwrap_or("unknown")
                ));
                self.fail(&error);
                Err(error)
            }
            TransportEvent::Malformed(reason) => {
                self.drop_frame(&reason);
                Ok(())
            }
            TransportEvent::Error(message) => {
                let error = Error::Connection(message);
                self.fail(&error);
                Err(error)
            }
            TransportEvent::Closed { code, reason } => self.on_closed(code, reason),
        }
    }

    fn on_open(&mut self) -> Result<()> {
        if self.state != SessionState::Connecting {
            tracing::debug!(state = ?self.state, "ignoring duplicate open");
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let started = self
            .capture
            .as_mut()
            .ok_or_else(|| Error::InvalidState("capture stream missing".to_string()))
            .and_then(|capture| capture.start(tx));

        if let Err(e) = started {
            self.fail(&e);
            return Err(e);
        }

        self.frames = Some(rx);
        self.set_state(SessionState::Open);
        tracing::info!("live session open");
        Ok(())
    }

    /// A close before the server accepted the setup is a failed handshake;
    /// once open, only a normal close code ends the session cleanly.
    fn on_closed(&mut self, code: Option<u16>, reason: Option<String>) -> Result<()> {
        let abnormal = code.is_some_and(|c| c != NORMAL_CLOSURE);

        if self.state == SessionState::Connecting || abnormal {
            let error = Error::Connection(match (code, reason.as_deref()) {
                (Some(code), Some(reason)) => format!("closed by server ({code}): {reason}"),
                (Some(code), None) => format!("closed by server ({code})"),
                (None, Some(reason)) => format!("closed by server: {reason}"),
                (None, None) => "connection closed before the session opened".to_string(),
            });
            self.fail(&error);
            return Err(error);
        }

        tracing::info!(
            code,
            reason = reason.as_deref().unwrap_or_default(),
            "connection closed by server"
        );
        self.close();
        Ok(())
    }

    fn send_frame(&self, frame: &[f32]) {
        if !self.is_active() {
            return;
        }
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        let message = ClientMessage::audio(
            codec::encode_pcm16(frame),
            self.config.audio.input_sample_rate,
        );
        if !connection.send(message) {
            tracing::trace!("outbound channel closed, frame discarded");
        }
    }

    /// Decode and schedule a server audio chunk
    ///
    /// Returns where the buffer landed on the output timeline, or `None` if
    /// the session is not active or the chunk was dropped.
    pub fn on_server_audio(&mut self, data: &str, sample_rate: u32) -> Option<ScheduledBuffer> {
        if !self.is_active() {
            tracing::trace!(state = ?self.state, "ignoring audio outside open session");
            return None;
        }

        match self.schedule_audio(data, sample_rate) {
            Ok(scheduled) => {
                tracing::trace!(
                    id = scheduled.id,
                    start_at = scheduled.start_at,
                    duration = scheduled.duration,
                    "scheduled server audio"
                );
                Some(scheduled)
            }
            Err(e) => {
                self.drop_frame(&e.to_string());
                None
            }
        }
    }

    fn schedule_audio(&mut self, data: &str, sample_rate: u32) -> Result<ScheduledBuffer> {
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| Error::InvalidState("output device closed".to_string()))?;

        let buffer = codec::decode_pcm16(data, sample_rate, self.config.audio.output_channels)?;
        let duration = buffer.duration();
        let start_at = device.now().max(self.cursor);

        let id = device.schedule(buffer, start_at)?;
        self.cursor = start_at + duration;

        let scheduled = ScheduledBuffer {
            id,
            start_at,
            duration,
        };
        self.scheduled.insert(id, scheduled);
        Ok(scheduled)
    }

    /// Stop all scheduled audio and reset the cursor
    pub fn on_server_interrupt(&mut self) {
        if !self.scheduled.is_empty() {
            tracing::debug!(
                stopped = self.scheduled.len(),
                "interrupted, discarding queued audio"
            );
        }

        for (id, _) in self.scheduled.drain() {
            if let Some(device) = self.device.as_mut() {
                device.stop(id);
            }
        }
        self.cursor = 0.0;
    }

    /// Forget a buffer that finished playing
    pub fn on_buffer_ended(&mut self, id: BufferId) {
        self.scheduled.remove(&id);
    }

    /// Release every resource; safe to call repeatedly or before `start()`
    pub fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            self.closing = connection.close();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.frames = None;
        if let Some(mut device) = self.device.take() {
            device.close();
        }

        self.scheduled.clear();
        self.cursor = 0.0;

        if self.state != SessionState::Closed {
            self.set_state(SessionState::Closed);
            tracing::info!("live session closed");
        }
    }

    fn fail(&mut self, error: &Error) {
        tracing::error!(error = %error, "live session failed");
        self.status
            .send_modify(|s| s.last_error = Some(error.to_string()));
        self.close();
    }

    fn drop_frame(&self, reason: &str) {
        tracing::warn!(reason, "dropping inbound audio frame");
        self.status.send_modify(|s| s.dropped_frames += 1);
    }

    fn set_state(&mut self, state: SessionState) {
        self.state = state;
        self.status.send_modify(|s| {
            s.state = state;
            s.active = state == SessionState::Open;
        });
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

async fn next_event(connection: Option<&mut Connection>) -> Option<TransportEvent> {
    match connection {
        Some(connection) => connection.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_frame(frames: Option<&mut mpsc::UnboundedReceiver<Vec<f32>>>) -> Option<Vec<f32>> {
    match frames {
        Some(frames) => frames.recv().await,
        None => std::future::pending().await,
    }
}

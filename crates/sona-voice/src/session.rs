//! Session boundary: the bidirectional channel to the remote speech model.
//!
//! The core treats the transport as opaque: it can be opened with a config and
//! an event sender, accepts fire-and-forget encoded audio, and reports what
//! the server said through [`SessionEvent`]s. Wire protocol and auth belong to
//! the transport implementation, not to this crate.

use crate::error::{VoiceError, VoiceResult};
use crate::pcm::EncodedChunk;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Capture-side sample rate, fixed by protocol convention.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Playback-side sample rate, fixed by protocol convention.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Config fields the transport needs from this core. Sample rates are fixed
/// by the protocol (16 kHz in, 24 kHz out, mono both ways).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub channels: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            channels: 1,
        }
    }
}

/// One inbound server message: optional synthesized audio and/or the
/// barge-in flag (the remote model noticed the user speaking over it).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerMessage {
    pub audio: Option<EncodedChunk>,
    #[serde(default)]
    pub interrupted: bool,
}

/// Events a transport delivers to the lifecycle manager.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The remote channel is established; capture may begin.
    Opened,
    /// A server message (audio and/or interruption).
    Message(ServerMessage),
    /// Hard transport failure; terminal for this conversation.
    Error(String),
    /// Orderly close from the remote end.
    Closed,
}

/// Factory side of the transport: opens the bidirectional channel.
pub trait SessionTransport: Send + Sync {
    /// Open the channel. Events (including `Opened`) arrive on `events`;
    /// the returned handle is the send side. Fails with
    /// [`VoiceError::SessionOpenFailed`] when the channel cannot be
    /// established.
    fn open(
        &self,
        config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> VoiceResult<Box<dyn SessionHandle>>;
}

/// Send side of an open session. Exactly one live handle per conversation,
/// owned by the lifecycle manager; not usable after `close`.
pub trait SessionHandle: Send + Sync {
    /// Fire-and-forget, non-blocking send. The transport owns any internal
    /// queuing; failures are logged by the implementation, never returned.
    fn send(&self, chunk: EncodedChunk);

    /// Close the channel. Sends after close are dropped.
    fn close(&self);
}

/// One step of a [`ScriptedSession`] playbook.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Pause before the next emission.
    Wait(Duration),
    /// Deliver an event to the core.
    Emit(SessionEvent),
}

/// In-process transport that replays a programmed sequence of server events
/// and records everything the core sends. Used by the integration tests and
/// the scripted demo; `Opened` is emitted as soon as the channel opens, then
/// the steps run on a background task.
pub struct ScriptedSession {
    steps: Mutex<Option<Vec<ScriptStep>>>,
    sent: Arc<Mutex<Vec<EncodedChunk>>>,
}

impl ScriptedSession {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(Some(steps)),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Everything the core has sent so far (capture frames, in order).
    pub fn sent(&self) -> Vec<EncodedChunk> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl SessionTransport for ScriptedSession {
    fn open(
        &self,
        _config: SessionConfig,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> VoiceResult<Box<dyn SessionHandle>> {
        let steps = self
            .steps
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| VoiceError::SessionOpenFailed("script already consumed".to_string()))?;

        events
            .send(SessionEvent::Opened)
            .map_err(|e| VoiceError::SessionOpenFailed(e.to_string()))?;

        // The handle co-owns the sender so the event channel stays open for
        // as long as the session does, not just until the script runs out.
        let handle = Box::new(ScriptedHandle {
            sent: Arc::clone(&self.sent),
            closed: AtomicBool::new(false),
            _events: events.clone(),
        });

        tokio::spawn(async move {
            for step in steps {
                match step {
                    ScriptStep::Wait(duration) => tokio::time::sleep(duration).await,
                    ScriptStep::Emit(event) => {
                        if events.send(event).is_err() {
                            // Core went away; nothing left to replay to.
                            break;
                        }
                    }
                }
            }
        });

        Ok(handle)
    }
}

struct ScriptedHandle {
    sent: Arc<Mutex<Vec<EncodedChunk>>>,
    closed: AtomicBool,
    _events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle for ScriptedHandle {
    fn send(&self, chunk: EncodedChunk) {
        if self.closed.load(Ordering::Acquire) {
            debug!("scripted session: send after close dropped");
            return;
        }
        self.sent.lock().unwrap().push(chunk);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Transport that always fails to open. Exercises the error path in tests.
pub struct UnreachableSession;

impl SessionTransport for UnreachableSession {
    fn open(
        &self,
        _config: SessionConfig,
        _events: mpsc::UnboundedSender<SessionEvent>,
    ) -> VoiceResult<Box<dyn SessionHandle>> {
        Err(VoiceError::SessionOpenFailed(
            "remote endpoint unreachable".to_string(),
        ))
    }
}

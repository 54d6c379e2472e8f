//! Conversation lifecycle: wires capture, session, and playback together and
//! guarantees that every start eventually releases the microphone, the output
//! device, and the session, no matter how the conversation ends.

use crate::capture::{CaptureConfig, CaptureHandle, CaptureSource, MicCapture, SessionSlot};
use crate::error::{VoiceError, VoiceResult};
use crate::pcm;
use crate::playback::{
    AudioSink, MonotonicClock, OutputClock, PlaybackEvent, PlaybackScheduler, RodioSink,
};
use crate::session::{SessionConfig, SessionEvent, SessionHandle, SessionTransport};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where the conversation currently is. `Error` is a resting state like
/// `Idle`; a new start is legal from either.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationState {
    Idle,
    Connecting,
    Active,
    Error(String),
}

/// What a frontend listens to.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    StateChanged {
        state: ConversationState,
        timestamp: DateTime<Utc>,
    },
    /// True while at least one model playback unit is scheduled or sounding.
    ModelSpeaking(bool),
}

#[derive(Debug, Clone, Default)]
pub struct ConversationConfig {
    pub capture: CaptureConfig,
    pub session: SessionConfig,
}

/// Creates the output sink at start time, so a stopped conversation holds no
/// output device.
pub trait SinkFactory: Send + Sync {
    fn create(&self, clock: Arc<dyn OutputClock>) -> VoiceResult<Arc<dyn AudioSink>>;
}

/// Opens a real rodio output on every start.
pub struct RodioSinkFactory;

impl SinkFactory for RodioSinkFactory {
    fn create(&self, clock: Arc<dyn OutputClock>) -> VoiceResult<Arc<dyn AudioSink>> {
        Ok(Arc::new(RodioSink::new(clock)?))
    }
}

/// Hands out one pre-built sink. For tests and scripted runs against a
/// [`crate::playback::RecordingSink`].
pub struct FixedSinkFactory(pub Arc<dyn AudioSink>);

impl SinkFactory for FixedSinkFactory {
    fn create(&self, _clock: Arc<dyn OutputClock>) -> VoiceResult<Arc<dyn AudioSink>> {
        Ok(Arc::clone(&self.0))
    }
}

/// Everything a running conversation holds. Dropping this releases the
/// microphone thread, the output device, and the session handle.
struct ActiveResources {
    session: Arc<dyn SessionHandle>,
    scheduler: Arc<PlaybackScheduler>,
    gate: Arc<AtomicBool>,
    slot: SessionSlot,
    capture: CaptureHandle,
    event_loop: tokio::task::JoinHandle<()>,
}

struct Inner {
    config: ConversationConfig,
    transport: Arc<dyn SessionTransport>,
    capture: Arc<dyn CaptureSource>,
    sink_factory: Arc<dyn SinkFactory>,
    clock: Arc<dyn OutputClock>,
    state: Mutex<ConversationState>,
    resources: Mutex<Option<ActiveResources>>,
    events: mpsc::UnboundedSender<ConversationEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ConversationEvent>>>,
}

/// One voice conversation. Construct once, start and stop as often as needed.
pub struct Conversation {
    inner: Arc<Inner>,
}

impl Conversation {
    /// Conversation over the given transport, using the real microphone and
    /// the default output device.
    pub fn new(config: ConversationConfig, transport: Arc<dyn SessionTransport>) -> Self {
        Self::with_parts(
            config,
            transport,
            Arc::new(MicCapture),
            Arc::new(RodioSinkFactory),
            Arc::new(MonotonicClock::new()),
        )
    }

    /// Full seam-injection constructor.
    pub fn with_parts(
        config: ConversationConfig,
        transport: Arc<dyn SessionTransport>,
        capture: Arc<dyn CaptureSource>,
        sink_factory: Arc<dyn SinkFactory>,
        clock: Arc<dyn OutputClock>,
    ) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                capture,
                sink_factory,
                clock,
                state: Mutex::new(ConversationState::Idle),
                resources: Mutex::new(None),
                events,
                event_rx: Mutex::new(Some(event_rx)),
            }),
        }
    }

    /// Take the event stream. Callable once.
    pub fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<ConversationEvent>> {
        self.inner.event_rx.lock().unwrap().take()
    }

    pub fn state(&self) -> ConversationState {
        self.inner.state.lock().unwrap().clone()
    }

    /// Open devices and the session. Legal from `Idle` or `Error`; any
    /// acquisition failure releases what was already acquired and lands in
    /// `Error`.
    pub fn start(&self) -> VoiceResult<()> {
        {
            let state = self.inner.state.lock().unwrap();
            match *state {
                ConversationState::Idle | ConversationState::Error(_) => {}
                _ => {
                    return Err(VoiceError::Session(format!(
                        "start while {:?}",
                        *state
                    )))
                }
            }
        }
        self.inner.set_state(ConversationState::Connecting);

        match self.acquire() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.set_state(ConversationState::Error(e.to_string()));
                Err(e)
            }
        }
    }

    fn acquire(&self) -> VoiceResult<()> {
        let inner = &self.inner;

        let sink = inner.sink_factory.create(Arc::clone(&inner.clock))?;
        let (scheduler, playback_rx) = PlaybackScheduler::new(Arc::clone(&inner.clock), sink);

        let gate = Arc::new(AtomicBool::new(false));
        let slot: SessionSlot = Arc::new(Mutex::new(None));
        let capture = inner
            .capture
            .start(&inner.config.capture, Arc::clone(&gate), Arc::clone(&slot))?;

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let session: Arc<dyn SessionHandle> = match inner
            .transport
            .open(inner.config.session.clone(), session_tx)
        {
            Ok(handle) => Arc::from(handle),
            Err(e) => {
                // Capture thread goes down with its handle.
                drop(capture);
                return Err(e);
            }
        };
        *slot.lock().unwrap() = Some(Arc::clone(&session));

        let event_loop = tokio::spawn(event_loop(
            Arc::clone(inner),
            session_rx,
            playback_rx,
            Arc::clone(&scheduler),
            Arc::clone(&gate),
        ));

        *inner.resources.lock().unwrap() = Some(ActiveResources {
            session,
            scheduler,
            gate,
            slot,
            capture,
            event_loop,
        });
        info!("conversation: resources acquired, waiting for session open");
        Ok(())
    }

    /// Stop and release everything. Idempotent.
    pub fn stop(&self) {
        self.inner.teardown(ConversationState::Idle);
    }

    /// Output gain; forwarded only while a conversation is running.
    pub fn set_volume(&self, volume: f32) {
        match self.inner.resources.lock().unwrap().as_ref() {
            Some(res) => res.scheduler.set_volume(volume),
            None => debug!("conversation: set_volume with no active playback"),
        }
    }

    /// Whether model audio is currently scheduled or sounding.
    pub fn is_model_speaking(&self) -> bool {
        self.inner
            .resources
            .lock()
            .unwrap()
            .as_ref()
            .map(|res| res.scheduler.is_active())
            .unwrap_or(false)
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.inner.teardown(ConversationState::Idle);
    }
}

impl Inner {
    fn set_state(&self, next: ConversationState) {
        let mut state = self.state.lock().unwrap();
        if *state == next {
            return;
        }
        debug!("conversation: {:?} -> {:?}", *state, next);
        *state = next.clone();
        let _ = self.events.send(ConversationEvent::StateChanged {
            state: next,
            timestamp: Utc::now(),
        });
    }

    /// The one teardown routine. Every exit path funnels through here, and a
    /// second call finds the resources already taken.
    fn teardown(&self, next: ConversationState) {
        let resources = self.resources.lock().unwrap().take();
        if let Some(res) = resources {
            res.gate.store(false, Ordering::Release);
            *res.slot.lock().unwrap() = None;
            if res.scheduler.is_active() {
                let _ = self.events.send(ConversationEvent::ModelSpeaking(false));
            }
            res.scheduler.cancel_all();
            res.session.close();
            res.event_loop.abort();
            drop(res.capture);
            info!("conversation: released microphone, output, and session");
        }
        self.set_state(next);
    }
}

/// Drains session and playback events until the session ends, then tears the
/// conversation down into the matching resting state.
async fn event_loop(
    inner: Arc<Inner>,
    mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    mut playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    scheduler: Arc<PlaybackScheduler>,
    gate: Arc<AtomicBool>,
) {
    let output_rate = inner.config.session.output_sample_rate;
    let mut playback_open = true;

    loop {
        tokio::select! {
            msg = session_rx.recv() => match msg {
                Some(SessionEvent::Opened) => {
                    gate.store(true, Ordering::Release);
                    inner.set_state(ConversationState::Active);
                }
                Some(SessionEvent::Message(message)) => {
                    // Audio first, then the interruption flag, in the order
                    // the server put them in one message.
                    if let Some(chunk) = &message.audio {
                        match pcm::decode_transport(&chunk.data)
                            .and_then(|bytes| pcm::bytes_to_frame(&bytes, output_rate, 1))
                        {
                            Ok(frame) => {
                                scheduler.enqueue(frame);
                            }
                            Err(e) => warn!("conversation: dropping bad audio chunk: {}", e),
                        }
                    }
                    if message.interrupted {
                        info!("conversation: model interrupted, cancelling playback");
                        scheduler.cancel_all();
                    }
                }
                Some(SessionEvent::Error(reason)) => {
                    warn!("conversation: session error: {}", reason);
                    inner.teardown(ConversationState::Error(reason));
                    break;
                }
                Some(SessionEvent::Closed) | None => {
                    inner.teardown(ConversationState::Idle);
                    break;
                }
            },
            ev = playback_rx.recv(), if playback_open => match ev {
                Some(PlaybackEvent::Started) => {
                    let _ = inner.events.send(ConversationEvent::ModelSpeaking(true));
                }
                Some(PlaybackEvent::Idle) => {
                    let _ = inner.events.send(ConversationEvent::ModelSpeaking(false));
                }
                None => playback_open = false,
            },
        }
    }
}

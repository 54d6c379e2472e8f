//! Microphone capture: fixed 4096-sample frames at 16 kHz mono, encoded and
//! forwarded to the session as they fill.
//!
//! The cpal `Stream` is `!Send` on some platforms, so a dedicated thread owns
//! it; the returned [`CaptureHandle`] is the Send-able lifetime token. Frames
//! produced while the session is not yet open are dropped, not buffered — the
//! protocol favors low latency over completeness, and buffering here would
//! reintroduce unbounded latency on reconnect.

use crate::error::{VoiceError, VoiceResult};
use crate::pcm::{self, AudioFrame};
use crate::session::SessionHandle;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

/// Samples per forwarded frame (256 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 4096;

/// Capture-side configuration.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate in Hz (default 16000, fixed by protocol convention).
    pub sample_rate: u32,
    /// Channel count (default 1).
    pub channels: u16,
    /// Samples per forwarded frame (default 4096).
    pub frame_samples: usize,
    /// Input device by name; `None` uses the default input device.
    pub device_name: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_samples: FRAME_SAMPLES,
            device_name: None,
        }
    }
}

/// Where capture frames go once the session exists. Filled by the lifecycle
/// manager after the transport opens; the gate flag opens on `Opened`.
pub type SessionSlot = Arc<Mutex<Option<Arc<dyn SessionHandle>>>>;

/// Accumulates device callbacks into fixed-size frames and forwards each one
/// synchronously: encode, then a non-blocking fire-and-forget send. At most
/// the partial frame under construction is ever held locally.
pub struct FrameForwarder {
    buffer: Vec<f32>,
    frame_samples: usize,
    sample_rate: u32,
    gate: Arc<AtomicBool>,
    session: SessionSlot,
    dropped: u64,
}

impl FrameForwarder {
    pub fn new(config: &CaptureConfig, gate: Arc<AtomicBool>, session: SessionSlot) -> Self {
        Self {
            buffer: Vec::with_capacity(config.frame_samples),
            frame_samples: config.frame_samples,
            sample_rate: config.sample_rate,
            gate,
            session,
            dropped: 0,
        }
    }

    /// Feed raw input-callback data; ships a frame every time one fills.
    pub fn push(&mut self, input: &[f32]) {
        for &sample in input {
            self.buffer.push(sample);
            if self.buffer.len() >= self.frame_samples {
                self.ship_frame();
            }
        }
    }

    fn ship_frame(&mut self) {
        let samples = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.frame_samples));

        if !self.gate.load(Ordering::Acquire) {
            self.dropped += 1;
            debug!("capture: session not open, dropped frame #{}", self.dropped);
            return;
        }

        let handle = match self.session.lock().unwrap().as_ref() {
            Some(handle) => Arc::clone(handle),
            None => {
                self.dropped += 1;
                debug!("capture: no session handle yet, dropped frame #{}", self.dropped);
                return;
            }
        };

        let frame = AudioFrame::new(samples, self.sample_rate);
        handle.send(pcm::encode_frame(&frame));
    }
}

/// Keeps the capture thread (and with it the microphone stream) alive.
/// Dropping it signals the thread, which drops the stream and exits.
pub struct CaptureHandle {
    shutdown: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CaptureHandle {
    /// Handle that owns no device. In-process capture sources (tests,
    /// scripted runs) return this.
    pub fn detached() -> Self {
        Self {
            shutdown: None,
            thread: None,
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Source of microphone frames. A seam so the lifecycle manager can run
/// against scripted input where no audio hardware exists.
pub trait CaptureSource: Send + Sync {
    fn start(
        &self,
        config: &CaptureConfig,
        gate: Arc<AtomicBool>,
        session: SessionSlot,
    ) -> VoiceResult<CaptureHandle>;
}

/// Real microphone via cpal.
pub struct MicCapture;

impl CaptureSource for MicCapture {
    fn start(
        &self,
        config: &CaptureConfig,
        gate: Arc<AtomicBool>,
        session: SessionSlot,
    ) -> VoiceResult<CaptureHandle> {
        let (result_tx, result_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
        let thread_config = config.clone();

        let thread = thread::spawn(move || {
            let stream = match build_input_stream(&thread_config, gate, session) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = result_tx.send(Err(e));
                    return;
                }
            };
            if result_tx.send(Ok(())).is_err() {
                return;
            }
            // Hold the stream until shutdown (or handle drop).
            let _ = shutdown_rx.recv();
            drop(stream);
            debug!("capture: microphone stream released");
        });

        result_rx
            .recv()
            .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))??;

        info!(
            "capture: microphone open ({} Hz, {} samples/frame)",
            config.sample_rate, config.frame_samples
        );

        Ok(CaptureHandle {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

fn build_input_stream(
    config: &CaptureConfig,
    gate: Arc<AtomicBool>,
    session: SessionSlot,
) -> VoiceResult<cpal::Stream> {
    let host = cpal::default_host();
    let device = match &config.device_name {
        Some(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
            .ok_or_else(|| {
                VoiceError::DeviceUnavailable(format!("input device '{}' not found", name))
            })?,
        None => host.default_input_device().ok_or_else(|| {
            VoiceError::DeviceUnavailable("no input device available".to_string())
        })?,
    };

    if let Ok(name) = device.name() {
        debug!("capture: using input device '{}'", name);
    }

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut forwarder = FrameForwarder::new(config, gate, session);
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            forwarder.push(data);
        },
        move |err| {
            warn!("capture: stream error: {}", err);
        },
        None,
    )?;

    stream.play()?;
    Ok(stream)
}

/// Capture source that opens no device and produces no frames. Used when the
/// conversation is driven entirely by a scripted transport.
pub struct NullCapture;

impl CaptureSource for NullCapture {
    fn start(
        &self,
        _config: &CaptureConfig,
        _gate: Arc<AtomicBool>,
        _session: SessionSlot,
    ) -> VoiceResult<CaptureHandle> {
        Ok(CaptureHandle::detached())
    }
}

/// List available input devices by name.
pub fn list_input_devices() -> VoiceResult<Vec<String>> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    for device in host.input_devices()? {
        if let Ok(name) = device.name() {
            names.push(name);
        }
    }
    Ok(names)
}

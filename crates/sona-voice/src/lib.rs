//! # Sona Voice - Real-Time Conversation Core
//!
//! This crate implements the client core of a full-duplex voice conversation:
//! continuous microphone capture streamed to a remote speech model, and the
//! model's synthesized replies scheduled into gapless playback that barge-in
//! can cut off mid-word.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Conversation                           │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │   Audio In   │→ │  PCM Encode  │→ │   Session    │       │
//! │  │    (cpal)    │  │ (i16/base64) │  │  Transport   │       │
//! │  └──────────────┘  └──────────────┘  └──────┬───────┘       │
//! │                                             ↓               │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐       │
//! │  │  Audio Out   │← │   Playback   │← │  PCM Decode  │       │
//! │  │   (rodio)    │  │  Scheduler   │  │ (interrupted │       │
//! │  └──────────────┘  └──────┬───────┘  │  kill signal)│       │
//! │                     cursor + active  └──────────────┘       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod conversation;
pub mod error;
pub mod pcm;
pub mod playback;
pub mod session;

pub use capture::{
    list_input_devices, CaptureConfig, CaptureHandle, CaptureSource, FrameForwarder, MicCapture,
    NullCapture, SessionSlot, FRAME_SAMPLES,
};
pub use conversation::{
    Conversation, ConversationConfig, ConversationEvent, ConversationState, FixedSinkFactory,
    RodioSinkFactory, SinkFactory,
};
pub use error::{VoiceError, VoiceResult};
pub use pcm::{bytes_to_frame, decode_transport, encode_frame, AudioFrame, EncodedChunk};
pub use playback::{
    AudioSink, CompletionTimer, ManualClock, MonotonicClock, OutputClock, PlaybackEvent,
    PlaybackScheduler, PlaybackUnit, RecordingSink, RodioSink,
};
pub use session::{
    ScriptStep, ScriptedSession, ServerMessage, SessionConfig, SessionEvent, SessionHandle,
    SessionTransport, UnreachableSession, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE,
};

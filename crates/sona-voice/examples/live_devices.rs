//! Example: Live Devices
//!
//! Opens the real microphone and output device for a few seconds to verify
//! the audio plumbing on this machine, using a scripted session in place of
//! a remote endpoint. You should hear a short tone after start.

use sona_voice::{
    encode_frame, AudioFrame, Conversation, ConversationConfig, ScriptStep, ScriptedSession,
    ServerMessage, SessionEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn tone(millis: u64, freq: f32) -> SessionEvent {
    let rate = 24_000u32;
    let samples: Vec<f32> = (0..(rate as u64 * millis / 1000))
        .map(|i| (i as f32 * freq * 2.0 * std::f32::consts::PI / rate as f32).sin() * 0.2)
        .collect();
    SessionEvent::Message(ServerMessage {
        audio: Some(encode_frame(&AudioFrame::new(samples, rate))),
        interrupted: false,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Live Devices Demo");
    info!("=================");
    for name in sona_voice::list_input_devices()? {
        info!("input device: {}", name);
    }

    let script = vec![
        ScriptStep::Wait(Duration::from_millis(500)),
        ScriptStep::Emit(tone(400, 440.0)),
        ScriptStep::Emit(tone(400, 550.0)),
        ScriptStep::Wait(Duration::from_secs(2)),
        ScriptStep::Emit(SessionEvent::Closed),
    ];

    let conversation = Conversation::new(
        ConversationConfig::default(),
        Arc::new(ScriptedSession::new(script)),
    );
    let mut events = conversation
        .take_event_receiver()
        .expect("event receiver already taken");

    conversation.start()?;
    info!("microphone is live; frames stream to the scripted session");

    while let Some(event) = events.recv().await {
        info!("{:?}", event);
        if matches!(
            event,
            sona_voice::ConversationEvent::StateChanged {
                state: sona_voice::ConversationState::Idle,
                ..
            }
        ) {
            break;
        }
    }

    info!("devices released");
    Ok(())
}

//! Example: Scripted Conversation
//!
//! Runs a full conversation lifecycle against an in-process scripted session:
//! a couple of synthesized reply chunks, a barge-in interruption, then an
//! orderly close. No microphone or speaker needed.

use sona_voice::{
    encode_frame, AudioFrame, Conversation, ConversationConfig, ConversationEvent,
    FixedSinkFactory, ManualClock, NullCapture, RecordingSink, ScriptStep, ScriptedSession,
    ServerMessage, SessionEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn reply(millis: u64) -> SessionEvent {
    let samples = vec![0.2f32; (24_000 * millis / 1000) as usize];
    SessionEvent::Message(ServerMessage {
        audio: Some(encode_frame(&AudioFrame::new(samples, 24_000))),
        interrupted: false,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Scripted Conversation Demo");
    info!("==========================");

    let script = vec![
        ScriptStep::Wait(Duration::from_millis(200)),
        ScriptStep::Emit(reply(400)),
        ScriptStep::Emit(reply(400)),
        ScriptStep::Wait(Duration::from_millis(300)),
        // The user talks over the model.
        ScriptStep::Emit(SessionEvent::Message(ServerMessage {
            audio: None,
            interrupted: true,
        })),
        ScriptStep::Wait(Duration::from_millis(200)),
        ScriptStep::Emit(reply(300)),
        ScriptStep::Wait(Duration::from_millis(300)),
        ScriptStep::Emit(SessionEvent::Closed),
    ];

    let sink = RecordingSink::new();
    let conversation = Conversation::with_parts(
        ConversationConfig::default(),
        Arc::new(ScriptedSession::new(script)),
        Arc::new(NullCapture),
        Arc::new(FixedSinkFactory(sink.clone())),
        Arc::new(ManualClock::new(0.0)),
    );

    let mut events = conversation
        .take_event_receiver()
        .expect("event receiver already taken");
    conversation.start()?;

    while let Some(event) = events.recv().await {
        match event {
            ConversationEvent::StateChanged { state, timestamp } => {
                info!("[{}] state: {:?}", timestamp.format("%H:%M:%S%.3f"), state);
                if state == sona_voice::ConversationState::Idle {
                    break;
                }
            }
            ConversationEvent::ModelSpeaking(flag) => {
                info!("model speaking: {}", flag);
            }
        }
    }

    info!(
        "done: {} chunk(s) reached the output, {} cancellation(s)",
        sink.play_count(),
        sink.stop_count()
    );
    Ok(())
}

//! Playback scheduling against a monotonic output clock.
//!
//! Frames arrive from the session one chunk at a time, with irregular timing.
//! The scheduler pins each unit's start to the previous unit's end (or to
//! "now" when the clock has run past the cursor), which yields gapless output
//! without pre-buffering. Interruption is one routine — [`PlaybackScheduler::
//! cancel_all`] — invoked identically for barge-in, manual stop, and hard
//! session errors.

use crate::error::{VoiceError, VoiceResult};
use crate::pcm::AudioFrame;
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Monotonic time source of the playback device, in seconds. The scheduling
/// reference for everything in this module; wall-clock time is never read.
pub trait OutputClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Production clock: seconds elapsed since construction.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputClock for MonotonicClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/// Manually advanced clock for deterministic scheduling tests.
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: f64) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance(&self, delta: f64) {
        *self.now.lock().unwrap() += delta;
    }
}

impl OutputClock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap()
    }
}

/// Completion callback for one queued unit. Must not be invoked from inside
/// `AudioSink::play` itself: the scheduler holds its lock across that call.
pub type CompletionFn = Box<dyn FnOnce() + Send>;

/// Output device boundary: accepts queued buffers back-to-back, reports when
/// each has finished sounding, and can halt everything at once.
pub trait AudioSink: Send + Sync {
    /// Queue one decoded buffer. `end_at` is the unit's scheduled end on the
    /// shared output clock; `on_ended` fires once it has finished sounding
    /// (or never, if the sink was stopped first — the scheduler tolerates
    /// both).
    fn play(&self, samples: Vec<f32>, sample_rate: u32, end_at: f64, on_ended: CompletionFn);

    /// Halt queued and sounding audio immediately. Stopping an
    /// already-finished unit is a no-op.
    fn stop(&self);

    /// Gain stage of the output device.
    fn set_volume(&self, volume: f32);
}

struct TimerQueue {
    pending: Vec<(f64, CompletionFn)>,
    shutdown: bool,
}

/// Fires queued completion callbacks at their deadlines on the shared clock,
/// all from one service thread. `clear` drops everything still pending
/// without running it, so whatever the callbacks captured is released the
/// moment the sink stops, not when the cancelled audio would have ended.
pub struct CompletionTimer {
    shared: Arc<(Mutex<TimerQueue>, Condvar)>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CompletionTimer {
    pub fn new(clock: Arc<dyn OutputClock>) -> Self {
        let shared = Arc::new((
            Mutex::new(TimerQueue {
                pending: Vec::new(),
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let thread_shared = Arc::clone(&shared);

        let thread = thread::spawn(move || {
            let (queue, signal) = &*thread_shared;
            let mut state = queue.lock().unwrap();
            loop {
                if state.shutdown {
                    break;
                }
                let now = clock.now();

                let mut due = Vec::new();
                let mut i = 0;
                while i < state.pending.len() {
                    if state.pending[i].0 <= now {
                        due.push(state.pending.remove(i).1);
                    } else {
                        i += 1;
                    }
                }
                if !due.is_empty() {
                    // Callbacks run outside the queue lock.
                    drop(state);
                    for on_ended in due {
                        on_ended();
                    }
                    state = queue.lock().unwrap();
                    continue;
                }

                let next = state
                    .pending
                    .iter()
                    .map(|(end_at, _)| *end_at)
                    .fold(f64::INFINITY, f64::min);
                state = if next.is_finite() {
                    let wait = Duration::from_secs_f64((next - now).max(0.0));
                    signal.wait_timeout(state, wait).unwrap().0
                } else {
                    signal.wait(state).unwrap()
                };
            }
        });

        Self {
            shared,
            thread: Some(thread),
        }
    }

    /// Queue `on_ended` to fire once the clock reaches `end_at`.
    pub fn schedule(&self, end_at: f64, on_ended: CompletionFn) {
        let (queue, signal) = &*self.shared;
        queue.lock().unwrap().pending.push((end_at, on_ended));
        signal.notify_one();
    }

    /// Drop every pending callback without running it.
    pub fn clear(&self) {
        let (queue, signal) = &*self.shared;
        queue.lock().unwrap().pending.clear();
        signal.notify_one();
    }

    pub fn pending_count(&self) -> usize {
        self.shared.0.lock().unwrap().pending.len()
    }
}

impl Drop for CompletionTimer {
    fn drop(&mut self) {
        {
            let (queue, signal) = &*self.shared;
            let mut state = queue.lock().unwrap();
            state.shutdown = true;
            state.pending.clear();
            signal.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Real output device: a rodio sink. The `OutputStream` is `!Send` on some
/// platforms, so a dedicated thread owns it; the `Sink` itself is shared and
/// controlled from wherever the scheduler runs.
pub struct RodioSink {
    sink: Arc<rodio::Sink>,
    timer: CompletionTimer,
    shutdown: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl RodioSink {
    pub fn new(clock: Arc<dyn OutputClock>) -> VoiceResult<Self> {
        let (result_tx, result_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();

        let thread = thread::spawn(move || {
            let built = rodio::OutputStream::try_default()
                .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))
                .and_then(|(stream, handle)| {
                    rodio::Sink::try_new(&handle)
                        .map(|sink| (stream, handle, Arc::new(sink)))
                        .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))
                });

            match built {
                Ok((stream, _handle, sink)) => {
                    if result_tx.send(Ok(Arc::clone(&sink))).is_err() {
                        return;
                    }
                    // Keep the stream alive until shutdown (or sender drop).
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = result_tx.send(Err(e));
                }
            }
        });

        let sink = result_rx
            .recv()
            .map_err(|e| VoiceError::DeviceUnavailable(e.to_string()))??;
        info!("playback: output device ready");

        Ok(Self {
            sink,
            timer: CompletionTimer::new(clock),
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl AudioSink for RodioSink {
    fn play(&self, samples: Vec<f32>, sample_rate: u32, end_at: f64, on_ended: CompletionFn) {
        self.sink
            .append(rodio::buffer::SamplesBuffer::new(1, sample_rate, samples));

        // The append-queue plays units back-to-back, so the scheduled end time
        // on the shared clock is also the audible end time.
        self.timer.schedule(end_at, on_ended);
    }

    fn stop(&self) {
        self.sink.stop();
        // Completions go with the audio; the scheduler has already forgotten
        // the cancelled ids.
        self.timer.clear();
    }

    fn set_volume(&self, volume: f32) {
        self.sink.set_volume(volume.max(0.0));
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        self.sink.stop();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!("playback: output device released");
    }
}

/// In-memory sink for tests and scripted runs: records every queued buffer
/// and lets the caller fire completions by hand.
pub struct RecordingSink {
    plays: Mutex<Vec<RecordedPlay>>,
    pending: Mutex<Vec<CompletionFn>>,
    stops: Mutex<u32>,
}

/// Bookkeeping copy of one `play` call on a [`RecordingSink`].
pub struct RecordedPlay {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub end_at: f64,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            plays: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            stops: Mutex::new(0),
        })
    }

    pub fn play_count(&self) -> usize {
        self.plays.lock().unwrap().len()
    }

    pub fn stop_count(&self) -> u32 {
        *self.stops.lock().unwrap()
    }

    pub fn end_times(&self) -> Vec<f64> {
        self.plays.lock().unwrap().iter().map(|p| p.end_at).collect()
    }

    /// Fire the completion callback of the oldest unfinished unit.
    pub fn finish_next(&self) -> bool {
        let next = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                None
            } else {
                Some(pending.remove(0))
            }
        };
        match next {
            Some(on_ended) => {
                on_ended();
                true
            }
            None => false,
        }
    }

    /// Fire every outstanding completion, oldest first.
    pub fn finish_all(&self) {
        while self.finish_next() {}
    }
}

impl AudioSink for RecordingSink {
    fn play(&self, samples: Vec<f32>, sample_rate: u32, end_at: f64, on_ended: CompletionFn) {
        self.plays.lock().unwrap().push(RecordedPlay {
            samples,
            sample_rate,
            end_at,
        });
        self.pending.lock().unwrap().push(on_ended);
    }

    fn stop(&self) {
        *self.stops.lock().unwrap() += 1;
    }

    fn set_volume(&self, _volume: f32) {}
}

/// Signals the lifecycle manager derives "model speaking" from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// At least one unit is scheduled or sounding (emitted before it sounds).
    Started,
    /// Nothing scheduled or sounding anymore.
    Idle,
}

/// Bookkeeping copy of one scheduled unit, returned by `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackUnit {
    pub id: u64,
    pub start_at: f64,
    pub duration: f64,
}

struct ScheduleState {
    /// Output-clock time the next unit should begin. Non-decreasing except on
    /// cancellation, when it resets to "now".
    cursor: f64,
    /// Ids of units currently scheduled or sounding.
    active: HashSet<u64>,
    next_id: u64,
}

/// Orders decoded frames into gapless sequential playback and owns the one
/// cancellation routine every interruption trigger goes through.
///
/// Cursor, active set, and sink calls all mutate under a single mutex, so an
/// enqueue and a cancellation serialize: a unit enqueued after `cancel_all`
/// is never retroactively cancelled, and no unit stays in the set while the
/// sink has already dropped it.
pub struct PlaybackScheduler {
    clock: Arc<dyn OutputClock>,
    sink: Arc<dyn AudioSink>,
    state: Mutex<ScheduleState>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl PlaybackScheduler {
    pub fn new(
        clock: Arc<dyn OutputClock>,
        sink: Arc<dyn AudioSink>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let cursor = clock.now();
        let scheduler = Arc::new(Self {
            clock,
            sink,
            state: Mutex::new(ScheduleState {
                cursor,
                active: HashSet::new(),
                next_id: 0,
            }),
            events,
        });
        (scheduler, events_rx)
    }

    /// Schedule one decoded frame: starts at `max(cursor, now)`, advances the
    /// cursor by the frame's duration, and registers a completion callback
    /// that retires the unit. Emits [`PlaybackEvent::Started`] when the
    /// active set goes empty → non-empty, before anything sounds.
    pub fn enqueue(self: &Arc<Self>, frame: AudioFrame) -> PlaybackUnit {
        let duration = frame.duration_secs();
        let sample_rate = frame.sample_rate();

        let mut state = self.state.lock().unwrap();
        let now = self.clock.now();
        let start_at = if now > state.cursor {
            // The scheduler fell behind (an earlier gap); start immediately
            // and accept the one-off gap instead of drifting forever.
            debug!(
                "playback: clock ran {}ms past cursor, starting now",
                ((now - state.cursor) * 1000.0) as u64
            );
            now
        } else {
            state.cursor
        };

        let id = state.next_id;
        state.next_id += 1;
        state.cursor = start_at + duration;

        if state.active.is_empty() {
            let _ = self.events.send(PlaybackEvent::Started);
        }
        state.active.insert(id);

        // Sink call stays under the lock so cancel_all cannot interleave
        // between bookkeeping and the device queue.
        let scheduler = Arc::clone(self);
        self.sink.play(
            frame.into_samples(),
            sample_rate,
            start_at + duration,
            Box::new(move || scheduler.complete(id)),
        );

        PlaybackUnit {
            id,
            start_at,
            duration,
        }
    }

    /// Retire a unit after it finished sounding. Safe to call for a unit that
    /// was already cancelled (set-difference, no-op the second time).
    pub fn complete(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        if state.active.remove(&id) && state.active.is_empty() {
            let _ = self.events.send(PlaybackEvent::Idle);
        }
    }

    /// The cancellation routine: halt the sink, clear the active set, reset
    /// the cursor to "now", and signal idle unconditionally. Single source of
    /// truth for barge-in, manual stop, and hard session errors alike.
    pub fn cancel_all(&self) {
        let mut state = self.state.lock().unwrap();
        self.sink.stop();
        let cancelled = state.active.len();
        state.active.clear();
        state.cursor = self.clock.now();
        let _ = self.events.send(PlaybackEvent::Idle);
        if cancelled > 0 {
            info!("playback: cancelled {} scheduled unit(s)", cancelled);
        }
    }

    pub fn set_volume(&self, volume: f32) {
        if !(0.0..=4.0).contains(&volume) {
            warn!("playback: clamping out-of-range volume {}", volume);
        }
        self.sink.set_volume(volume.clamp(0.0, 4.0));
    }

    /// Whether any unit is scheduled or sounding.
    pub fn is_active(&self) -> bool {
        !self.state.lock().unwrap().active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    /// Current schedule cursor on the output clock.
    pub fn cursor(&self) -> f64 {
        self.state.lock().unwrap().cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_ms(ms: u64, rate: u32) -> AudioFrame {
        let samples = vec![0.0f32; (rate as u64 * ms / 1000) as usize];
        AudioFrame::new(samples, rate)
    }

    fn setup() -> (
        Arc<ManualClock>,
        Arc<RecordingSink>,
        Arc<PlaybackScheduler>,
        mpsc::UnboundedReceiver<PlaybackEvent>,
    ) {
        let clock = Arc::new(ManualClock::new(10.0));
        let sink = RecordingSink::new();
        let (scheduler, events) =
            PlaybackScheduler::new(clock.clone() as Arc<dyn OutputClock>, sink.clone());
        (clock, sink, scheduler, events)
    }

    #[test]
    fn back_to_back_frames_schedule_gapless() {
        let (_clock, _sink, scheduler, _events) = setup();

        let a = scheduler.enqueue(frame_ms(200, 24_000));
        let b = scheduler.enqueue(frame_ms(200, 24_000));
        let c = scheduler.enqueue(frame_ms(200, 24_000));

        assert!((a.start_at - 10.0).abs() < 1e-9);
        assert!((b.start_at - (a.start_at + a.duration)).abs() < 1e-9);
        assert!((c.start_at - (b.start_at + b.duration)).abs() < 1e-9);
        assert!((scheduler.cursor() - 10.6).abs() < 1e-9);
        assert_eq!(scheduler.active_count(), 3);
    }

    #[test]
    fn start_times_are_monotonic_with_arbitrary_arrival_delays() {
        let (clock, _sink, scheduler, _events) = setup();

        let mut previous: Option<PlaybackUnit> = None;
        for (delay, ms) in [(0.0, 100), (0.05, 200), (0.6, 50), (0.0, 300), (0.01, 80)] {
            clock.advance(delay);
            let unit = scheduler.enqueue(frame_ms(ms, 24_000));
            if let Some(prev) = previous {
                assert!(unit.start_at >= prev.start_at);
                assert!(unit.start_at >= prev.start_at + prev.duration - 1e-9);
            }
            previous = Some(unit);
        }
    }

    #[test]
    fn lagging_scheduler_starts_immediately_instead_of_drifting() {
        let (clock, _sink, scheduler, _events) = setup();

        let a = scheduler.enqueue(frame_ms(100, 24_000));
        // Clock runs well past the cursor before the next frame arrives.
        clock.set(a.start_at + a.duration + 2.0);
        let b = scheduler.enqueue(frame_ms(100, 24_000));

        assert!((b.start_at - clock.now()).abs() < 1e-9);
        assert!((scheduler.cursor() - (b.start_at + b.duration)).abs() < 1e-9);
    }

    #[test]
    fn started_emitted_on_first_unit_before_completion() {
        let (_clock, _sink, scheduler, mut events) = setup();

        scheduler.enqueue(frame_ms(100, 24_000));
        assert_eq!(events.try_recv().unwrap(), PlaybackEvent::Started);
        // Second unit while still active: no duplicate signal.
        scheduler.enqueue(frame_ms(100, 24_000));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn idle_emitted_when_last_unit_completes_naturally() {
        let (_clock, sink, scheduler, mut events) = setup();

        scheduler.enqueue(frame_ms(100, 24_000));
        scheduler.enqueue(frame_ms(100, 24_000));
        assert_eq!(events.try_recv().unwrap(), PlaybackEvent::Started);

        sink.finish_next();
        assert!(events.try_recv().is_err());
        assert_eq!(scheduler.active_count(), 1);

        sink.finish_next();
        assert_eq!(events.try_recv().unwrap(), PlaybackEvent::Idle);
        assert!(!scheduler.is_active());
    }

    #[test]
    fn cancel_all_clears_state_and_resets_cursor_to_now() {
        let (clock, sink, scheduler, mut events) = setup();

        scheduler.enqueue(frame_ms(200, 24_000));
        scheduler.enqueue(frame_ms(200, 24_000));
        scheduler.enqueue(frame_ms(200, 24_000));
        assert_eq!(events.try_recv().unwrap(), PlaybackEvent::Started);

        clock.set(10.05);
        scheduler.cancel_all();

        assert_eq!(scheduler.active_count(), 0);
        assert!((scheduler.cursor() - 10.05).abs() < 1e-9);
        assert_eq!(sink.stop_count(), 1);
        // Idle fires exactly once for the cancellation...
        assert_eq!(events.try_recv().unwrap(), PlaybackEvent::Idle);
        assert!(events.try_recv().is_err());

        // ...and late completion callbacks from the sink are harmless no-ops.
        sink.finish_all();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn unit_enqueued_after_cancel_is_not_retroactively_cancelled() {
        let (_clock, sink, scheduler, mut events) = setup();

        scheduler.enqueue(frame_ms(100, 24_000));
        scheduler.cancel_all();
        let _ = events.try_recv(); // Started
        let _ = events.try_recv(); // Idle

        let unit = scheduler.enqueue(frame_ms(100, 24_000));
        assert_eq!(scheduler.active_count(), 1);
        assert!((unit.start_at - scheduler.cursor() + unit.duration).abs() < 1e-9);
        assert_eq!(sink.play_count(), 2);
        assert_eq!(events.try_recv().unwrap(), PlaybackEvent::Started);
    }

    #[test]
    fn double_completion_is_a_noop() {
        let (_clock, _sink, scheduler, mut events) = setup();

        let unit = scheduler.enqueue(frame_ms(100, 24_000));
        let _ = events.try_recv(); // Started

        scheduler.complete(unit.id);
        assert_eq!(events.try_recv().unwrap(), PlaybackEvent::Idle);

        scheduler.complete(unit.id);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn sink_receives_scheduled_end_times() {
        let (_clock, sink, scheduler, _events) = setup();

        let a = scheduler.enqueue(frame_ms(250, 24_000));
        let b = scheduler.enqueue(frame_ms(250, 24_000));

        let ends = sink.end_times();
        assert!((ends[0] - (a.start_at + a.duration)).abs() < 1e-9);
        assert!((ends[1] - (b.start_at + b.duration)).abs() < 1e-9);
    }

    #[test]
    fn completion_timer_fires_at_the_deadline() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let clock = Arc::new(MonotonicClock::new());
        let timer = CompletionTimer::new(clock.clone() as Arc<dyn OutputClock>);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        timer.schedule(
            clock.now() + 0.05,
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );

        thread::sleep(Duration::from_millis(300));
        assert!(fired.load(Ordering::SeqCst));
        assert_eq!(timer.pending_count(), 0);
    }

    #[test]
    fn cleared_completions_never_fire_and_release_what_they_captured() {
        let clock = Arc::new(MonotonicClock::new());
        let timer = CompletionTimer::new(clock.clone() as Arc<dyn OutputClock>);

        let payload = Arc::new(());
        let held = Arc::clone(&payload);
        timer.schedule(clock.now() + 30.0, Box::new(move || drop(held)));
        assert_eq!(timer.pending_count(), 1);

        timer.clear();
        assert_eq!(timer.pending_count(), 0);
        // The captured Arc went with the dropped callback.
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn timer_drop_returns_promptly_with_distant_deadlines_pending() {
        let clock = Arc::new(MonotonicClock::new());
        let timer = CompletionTimer::new(clock as Arc<dyn OutputClock>);
        timer.schedule(3600.0, Box::new(|| {}));

        let started = Instant::now();
        drop(timer);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn scheduler_is_released_as_soon_as_a_timed_sink_is_stopped() {
        // A stopped sink must not retain the completion closures (and through
        // them the scheduler) until the cancelled audio's deadlines pass.
        struct TimedSink {
            timer: CompletionTimer,
        }
        impl AudioSink for TimedSink {
            fn play(&self, _s: Vec<f32>, _r: u32, end_at: f64, on_ended: CompletionFn) {
                self.timer.schedule(end_at, on_ended);
            }
            fn stop(&self) {
                self.timer.clear();
            }
            fn set_volume(&self, _v: f32) {}
        }

        let clock = Arc::new(MonotonicClock::new());
        let sink = Arc::new(TimedSink {
            timer: CompletionTimer::new(clock.clone() as Arc<dyn OutputClock>),
        });
        let (scheduler, _events) =
            PlaybackScheduler::new(clock as Arc<dyn OutputClock>, sink.clone());

        // Deadlines an hour out (1 Hz keeps the buffers tiny); only
        // cancellation can free the closures.
        scheduler.enqueue(AudioFrame::new(vec![0.0; 3600], 1));
        scheduler.enqueue(AudioFrame::new(vec![0.0; 3600], 1));
        assert!(Arc::strong_count(&scheduler) > 1);

        scheduler.cancel_all();
        assert_eq!(Arc::strong_count(&scheduler), 1);
    }
}

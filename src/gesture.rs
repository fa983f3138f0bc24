//! Accelerometer step detection.
//!
//! A small signal-processing pipeline over the vertical accelerometer
//! axis: subtract gravity, median-filter, de-mean, then look for
//! negative-to-positive zero crossings whose following swing is large
//! enough to be a footfall. Steps alternate even/odd so a consumer can
//! drive left/right command triggers, and a four-second lull ends the
//! walk. Sampling runs on its own thread feeding a mutex-guarded buffer,
//! the only cross-thread boundary in the crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, warn};

const GRAVITY: f64 = 9.8;
const MEDIAN_WINDOW: usize = 10;
const DETECTION_WINDOW: usize = 30;
const DETECTION_STRIDE: usize = 15;
const STEP_LOOKAHEAD: usize = 20;
const STEP_THRESHOLD: f64 = 0.3;
const PROCESS_BATCH: usize = 50;
const WALKING_STOPPED_AFTER: Duration = Duration::from_secs(4);
const BUFFER_TRUNCATE_AT: usize = 5_000;
const BUFFER_KEEP: usize = 1_000;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Events raised while the wearer moves.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StepEvent {
    /// An even-numbered footfall.
    EvenStep,
    /// An odd-numbered footfall.
    OddStep,
    /// No footfall for four seconds; the step counter resets.
    WalkingStopped,
}

/// Supplies vertical-axis acceleration samples at the sensor's cadence.
///
/// `next_sample` may block until a sample is ready; returning `None`
/// ends the sampling loop.
pub trait AccelerometerSource: Send {
    fn next_sample(&mut self) -> Option<f64>;
}

/// The detection pipeline, free of threads and timers.
#[derive(Debug, Default)]
pub struct StepDetector {
    step_count: u64,
}

impl StepDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    /// Forgets the walk in progress.
    pub fn reset(&mut self) {
        self.step_count = 0;
    }

    /// Runs the pipeline over one batch of raw samples and returns the
    /// footfalls found, in order.
    pub fn process_batch(&mut self, samples: &[f64]) -> Vec<StepEvent> {
        if samples.is_empty() {
            return Vec::new();
        }

        let adjusted: Vec<f64> = samples.iter().map(|sample| sample - GRAVITY).collect();
        let filtered = median_filter(&adjusted);
        let mean = filtered.iter().sum::<f64>() / filtered.len() as f64;
        let demeaned: Vec<f64> = filtered.iter().map(|value| value - mean).collect();

        let mut events = Vec::new();
        let mut last_candidate = 0usize;
        let mut start = 0usize;
        loop {
            let end = (start + DETECTION_WINDOW).min(demeaned.len());
            for index in start.max(1)..end {
                if demeaned[index - 1] < 0.0 && demeaned[index] >= 0.0 && index > last_candidate {
                    last_candidate = index;
                    let look_end = (index + STEP_LOOKAHEAD).min(demeaned.len());
                    let swing = demeaned[index..look_end]
                        .iter()
                        .fold(0.0f64, |peak, value| peak.max(value.abs()));
                    if swing > STEP_THRESHOLD {
                        self.step_count += 1;
                        events.push(if self.step_count % 2 == 0 {
                            StepEvent::EvenStep
                        } else {
                            StepEvent::OddStep
                        });
                    }
                }
            }

            if end == demeaned.len() {
                break;
            }
            start += DETECTION_STRIDE;
        }
        events
    }
}

fn median_filter(samples: &[f64]) -> Vec<f64> {
    let mut filtered = Vec::with_capacity(samples.len());
    for index in 0..samples.len() {
        let window_start = index.saturating_sub(MEDIAN_WINDOW - 1);
        let mut window: Vec<f64> = samples[window_start..=index].to_vec();
        window.sort_by(|left, right| left.total_cmp(right));
        filtered.push(window[window.len() / 2]);
    }
    filtered
}

/// The rolling sample buffer shared between the sampling thread and the
/// detector.
#[derive(Debug, Default)]
pub struct SampleBuffer {
    samples: Vec<f64>,
    processed: usize,
}

impl SampleBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Appends a sample. Once a full batch of unprocessed samples has
    /// accumulated, returns it for detection.
    pub fn push(&mut self, sample: f64) -> Option<Vec<f64>> {
        self.samples.push(sample);
        if self.samples.len() >= BUFFER_TRUNCATE_AT {
            let drop = self.samples.len() - BUFFER_KEEP;
            self.samples.drain(..drop);
            self.processed = self.processed.saturating_sub(drop);
        }

        if self.samples.len() - self.processed >= PROCESS_BATCH {
            let batch = self.samples[self.processed..].to_vec();
            self.processed = self.samples.len();
            Some(batch)
        } else {
            None
        }
    }
}

/// Tracks the quiet gap since the last footfall. Fires once per walk,
/// then stays silent until steps resume.
#[derive(Debug, Default)]
struct LullGate {
    last_step: Option<Instant>,
}

impl LullGate {
    fn note_steps(&mut self, now: Instant) {
        self.last_step = Some(now);
    }

    fn stopped(&mut self, now: Instant) -> bool {
        match self.last_step {
            Some(last) if now.duration_since(last) >= WALKING_STOPPED_AFTER => {
                self.last_step = None;
                true
            }
            _ => false,
        }
    }
}

/// A running sampling thread.
#[derive(Debug)]
pub struct StepSampler {
    stop: Arc<AtomicBool>,
    buffer: Arc<Mutex<SampleBuffer>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StepSampler {
    /// The shared sample buffer, for diagnostics.
    #[must_use]
    pub fn buffer(&self) -> Arc<Mutex<SampleBuffer>> {
        Arc::clone(&self.buffer)
    }

    /// Asks the sampling loop to finish and waits for it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("accelerometer sampling thread panicked");
        }
    }
}

impl Drop for StepSampler {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

/// Spawns the sampling thread over the given source and returns the
/// stream of step events.
#[must_use]
pub fn spawn_sampler(
    mut source: impl AccelerometerSource + 'static,
) -> (StepSampler, mpsc::Receiver<StepEvent>) {
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let buffer = Arc::new(Mutex::new(SampleBuffer::new()));
    let shared_buffer = Arc::clone(&buffer);

    let handle = thread::spawn(move || {
        let mut detector = StepDetector::new();
        let mut gate = LullGate::default();

        while !stop_flag.load(Ordering::Relaxed) {
            let Some(sample) = source.next_sample() else {
                break;
            };

            let batch = {
                let mut buffer = buffer.lock().expect("sample buffer lock poisoned");
                buffer.push(sample)
            };
            if let Some(batch) = batch {
                let events = detector.process_batch(&batch);
                if !events.is_empty() {
                    gate.note_steps(Instant::now());
                }
                for event in events {
                    if event_tx.blocking_send(event).is_err() {
                        return;
                    }
                }
            }

            // Checked on every sample, not only at batch boundaries, so
            // a lull is noticed even while a batch is still filling.
            if gate.stopped(Instant::now()) {
                debug!(steps = detector.step_count(), "walking stopped");
                detector.reset();
                if event_tx.blocking_send(StepEvent::WalkingStopped).is_err() {
                    return;
                }
            }
        }
    });

    (
        StepSampler {
            stop,
            buffer: shared_buffer,
            handle: Some(handle),
        },
        event_rx,
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Ten samples below gravity, ten above, repeating. Each upward
    /// transition is one footfall.
    fn stomping_signal(cycles: usize) -> Vec<f64> {
        let mut samples = Vec::new();
        for _ in 0..cycles {
            samples.extend(std::iter::repeat_n(GRAVITY - 1.0, 10));
            samples.extend(std::iter::repeat_n(GRAVITY + 1.0, 10));
        }
        samples
    }

    #[test]
    fn a_still_wearer_produces_no_steps() {
        let mut detector = StepDetector::new();

        let events = detector.process_batch(&vec![GRAVITY; PROCESS_BATCH]);

        assert!(events.is_empty());
        assert_eq!(0, detector.step_count());
    }

    #[test]
    fn small_jitter_stays_below_the_step_threshold() {
        let mut detector = StepDetector::new();
        let samples: Vec<f64> = (0..PROCESS_BATCH)
            .map(|index| GRAVITY + if index % 2 == 0 { 0.05 } else { -0.05 })
            .collect();

        assert!(detector.process_batch(&samples).is_empty());
    }

    #[test]
    fn footfalls_alternate_odd_and_even() {
        let mut detector = StepDetector::new();

        let events = detector.process_batch(&stomping_signal(2));

        assert_eq!(vec![StepEvent::OddStep, StepEvent::EvenStep], events);
        assert_eq!(2, detector.step_count());
    }

    #[test]
    fn the_count_carries_across_batches_until_reset() {
        let mut detector = StepDetector::new();

        let first = detector.process_batch(&stomping_signal(1));
        let second = detector.process_batch(&stomping_signal(1));

        assert_eq!(vec![StepEvent::OddStep], first);
        assert_eq!(vec![StepEvent::EvenStep], second);

        detector.reset();
        assert_eq!(0, detector.step_count());
        assert_eq!(
            vec![StepEvent::OddStep],
            detector.process_batch(&stomping_signal(1))
        );
    }

    #[test]
    fn buffer_hands_out_full_batches_only() {
        let mut buffer = SampleBuffer::new();

        for index in 0..PROCESS_BATCH - 1 {
            assert_eq!(None, buffer.push(index as f64));
        }
        let batch = buffer.push(49.0).expect("batch boundary reached");

        assert_eq!(PROCESS_BATCH, batch.len());
        assert_eq!(0.0, batch[0]);
        assert_eq!(49.0, batch[PROCESS_BATCH - 1]);
    }

    #[test]
    fn buffer_truncates_to_the_most_recent_samples() {
        let mut buffer = SampleBuffer::new();
        for index in 0..BUFFER_TRUNCATE_AT {
            buffer.push(index as f64);
        }

        assert_eq!(BUFFER_KEEP, buffer.len());
        // A fresh batch still forms from samples pushed after truncation.
        for index in 0..PROCESS_BATCH {
            let batch = buffer.push(index as f64);
            if index == PROCESS_BATCH - 1 {
                assert_eq!(Some(PROCESS_BATCH), batch.map(|samples| samples.len()));
            } else {
                assert_eq!(None, batch);
            }
        }
    }

    #[test]
    fn the_lull_gate_fires_once_after_four_quiet_seconds() {
        let mut gate = LullGate::default();
        let start = Instant::now();

        // Quiet from the start is not a walk ending.
        assert!(!gate.stopped(start));

        gate.note_steps(start);
        assert!(!gate.stopped(start + Duration::from_secs(3)));
        assert!(gate.stopped(start + Duration::from_secs(4)));
        // Already fired; quiet after that stays quiet.
        assert!(!gate.stopped(start + Duration::from_secs(60)));

        gate.note_steps(start + Duration::from_secs(60));
        assert!(gate.stopped(start + Duration::from_secs(65)));
    }

    struct ScriptedSource {
        samples: std::vec::IntoIter<f64>,
    }

    impl AccelerometerSource for ScriptedSource {
        fn next_sample(&mut self) -> Option<f64> {
            self.samples.next()
        }
    }

    #[tokio::test]
    async fn sampler_thread_emits_steps_from_a_scripted_source() {
        let samples = stomping_signal(5);
        let (sampler, mut events) = spawn_sampler(ScriptedSource {
            samples: samples.into_iter(),
        });

        assert_eq!(Some(StepEvent::OddStep), events.recv().await);
        assert_eq!(Some(StepEvent::EvenStep), events.recv().await);
        assert_eq!(Some(StepEvent::OddStep), events.recv().await);
        assert_eq!(Some(StepEvent::EvenStep), events.recv().await);
        assert_eq!(None, events.recv().await);

        sampler.stop();
    }
}

//! # Poll-Forward Loop
//!
//! The heart of the forwarder. On every tick it asks the historian for the
//! samples recorded after the watermark, publishes them one by one to the
//! broker and moves the watermark forward only after the broker confirmed
//! each delivery.
//!
//! ## Key Design Principles:
//! - **Strictly Sequential**: read → publish → advance, never overlapping. A
//!   single task owns the loop, so the watermark needs no locking.
//! - **Per-Sample Advance**: the watermark follows every confirmed publish.
//!   Samples sharing a timestamp form a run and the watermark moves once, at
//!   the end of the run, because the historian query is exclusive of the
//!   watermark and would otherwise hide the rest of the run after a failure.
//! - **At-Least-Once**: a sample is forgotten only after its timestamp is
//!   durable. Anything published but not yet advanced is simply sent again.
//! - **Non-Blocking Data Loss**: a sample the broker can never accept is
//!   skipped with a warning instead of stalling the stream forever.
//! - **Backoff**: transient failures of either endpoint are retried with an
//!   exponential delay that resets after the next clean tick.
//!
//! ## States:
//! `Idle -> Reading -> Publishing -> Advancing -> Idle`, with `Backoff`
//! entered from any failure point.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::core::backoff::Backoff;
use crate::core::endpoints::{BrokerPublisher, HistorianReader};
use crate::core::errors::{ForwarderError, PublishError, ReadError, WatermarkError};
use crate::core::sample::Sample;
use crate::core::watermark::{Watermark, WatermarkStore};

/// What to do when the historian reports a permanent error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermanentErrorPolicy {
    /// Stop the loop and let the process exit non-zero.
    #[default]
    Exit,
    /// Stay alive doing nothing until shutdown, then exit cleanly.
    Pause,
}

/// # Forward Settings
///
/// Static parameters of the loop.
#[derive(Debug, Clone)]
pub struct ForwardSettings {
    /// Historian dataset to read.
    pub dataset_id: String,
    /// MQTT topic every sample is published to.
    pub topic: String,
    /// Pause between two successful ticks.
    pub poll_interval: Duration,
    /// First retry delay after a failed tick.
    pub retry_base_delay: Duration,
    /// Upper bound of the retry delay.
    pub retry_max_delay: Duration,
    /// Reaction to permanent historian errors.
    pub on_permanent_read_error: PermanentErrorPolicy,
}

/// Observable loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Reading,
    Publishing,
    Advancing,
    Backoff,
}

/// How a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The historian had nothing new.
    Empty,
    /// Every sample was published (or skipped) and the watermark followed.
    Completed,
    /// A transient failure stopped the tick; retry after backoff.
    Retry,
    /// Shutdown was requested while the tick was running.
    Interrupted,
}

/// Counters of a single tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Samples newer than the watermark returned by the historian.
    pub read: usize,
    /// Samples confirmed by the broker.
    pub published: usize,
    /// Samples dropped because of permanent publish errors.
    pub skipped: usize,
    pub outcome: TickOutcome,
}

impl TickReport {
    fn new(outcome: TickOutcome) -> Self {
        Self {
            read: 0,
            published: 0,
            skipped: 0,
            outcome,
        }
    }
}

/// # Forward Loop
///
/// Owns the two endpoints and the retry policy. The watermark is lent to
/// every tick by the caller.
pub struct ForwardLoop<R, P> {
    reader: R,
    publisher: P,
    settings: ForwardSettings,
    backoff: Backoff,
    state: LoopState,
}

impl<R: HistorianReader, P: BrokerPublisher> ForwardLoop<R, P> {
    pub fn new(reader: R, publisher: P, settings: ForwardSettings) -> Self {
        let backoff = Backoff::new(settings.retry_base_delay, settings.retry_max_delay);
        Self {
            reader,
            publisher,
            settings,
            backoff,
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn settings(&self) -> &ForwardSettings {
        &self.settings
    }

    pub fn reader(&self) -> &R {
        &self.reader
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Hands the endpoints back, e.g. to disconnect them on shutdown.
    pub fn into_parts(self) -> (R, P) {
        (self.reader, self.publisher)
    }

    /// # Main Execution Loop
    ///
    /// Runs ticks until `shutdown` fires.
    ///
    /// ## Workflow:
    /// 1.  **Tick**: read, publish and advance (see [`ForwardLoop::tick`]).
    /// 2.  **Schedule**: sleep the poll interval after a clean tick, or the
    ///     backoff delay after a failed one.
    /// 3.  **Stop**: a shutdown signal interrupts the sleep or the running
    ///     tick; no new tick is started afterwards.
    ///
    /// # Errors
    /// Returns the fatal errors: a permanent historian error (unless the
    /// policy is [`PermanentErrorPolicy::Pause`]) or a watermark invariant
    /// violation.
    pub async fn run<S: WatermarkStore>(
        &mut self,
        watermark: &mut Watermark<S>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ForwarderError> {
        log::info!(
            "Forwarding dataset {} to topic {} every {:?}, starting after {}",
            self.settings.dataset_id,
            self.settings.topic,
            self.settings.poll_interval,
            watermark.get()
        );

        loop {
            if shutdown_requested(shutdown) {
                break;
            }

            // --- Phase 1: One Tick ---
            let report = match self.tick(watermark, shutdown).await {
                Ok(report) => report,
                Err(ForwarderError::PermanentRead(e))
                    if self.settings.on_permanent_read_error == PermanentErrorPolicy::Pause =>
                {
                    log::error!(
                        "Dataset {} cannot be read ({}). Forwarding paused until shutdown.",
                        self.settings.dataset_id,
                        e
                    );
                    self.state = LoopState::Idle;
                    let _ = shutdown.recv().await;
                    break;
                }
                Err(e) => {
                    log::error!("Forward loop stopped: {}", e);
                    return Err(e);
                }
            };

            if report.outcome == TickOutcome::Interrupted {
                break;
            }

            // --- Phase 2: Schedule Next Tick ---
            let delay = self.delay_after(&report);
            log::debug!("Sleeping for {:?}", delay);

            let stopped = tokio::select! {
                _ = shutdown.recv() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if stopped {
                break;
            }
        }

        self.state = LoopState::Idle;
        log::info!("Forward loop stopped at watermark {}", watermark.get());
        Ok(())
    }

    /// # Single Tick
    ///
    /// Reads everything after the watermark and forwards it in order.
    ///
    /// - Transient read or publish errors end the tick with
    ///   [`TickOutcome::Retry`]; nothing after the failing sample is sent and
    ///   the watermark stays before it.
    /// - Permanent publish errors (and samples that cannot be encoded) are
    ///   skipped and the watermark moves past them.
    /// - A watermark store failure is treated as transient.
    pub async fn tick<S: WatermarkStore>(
        &mut self,
        watermark: &mut Watermark<S>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<TickReport, ForwarderError> {
        // --- Phase 1: Read ---
        self.state = LoopState::Reading;
        let since = watermark.get();

        let read = tokio::select! {
            _ = shutdown.recv() => None,
            result = self.reader.read_since(&self.settings.dataset_id, since) => Some(result),
        };

        let samples = match read {
            None => return Ok(self.interrupted(TickReport::new(TickOutcome::Interrupted))),
            Some(Ok(samples)) => samples,
            Some(Err(ReadError::Transient(reason))) => {
                log::warn!("Historian read failed, will retry: {}", reason);
                self.state = LoopState::Backoff;
                return Ok(TickReport::new(TickOutcome::Retry));
            }
            Some(Err(e @ ReadError::Permanent(_))) => {
                self.state = LoopState::Backoff;
                return Err(ForwarderError::PermanentRead(e));
            }
        };

        let samples = fresh_samples(samples, since);
        if samples.is_empty() {
            log::trace!("No new samples after {}", since);
            self.state = LoopState::Idle;
            return Ok(TickReport::new(TickOutcome::Empty));
        }

        let mut report = TickReport::new(TickOutcome::Completed);
        report.read = samples.len();
        log::debug!("Read {} new samples after {}", samples.len(), since);

        // --- Phase 2: Publish and Advance, sample by sample ---
        for (idx, sample) in samples.iter().enumerate() {
            if shutdown_requested(shutdown) {
                report.outcome = TickOutcome::Interrupted;
                return Ok(self.interrupted(report));
            }

            self.state = LoopState::Publishing;
            let published = match sample.to_payload() {
                Ok(payload) => {
                    tokio::select! {
                        _ = shutdown.recv() => None,
                        result = self.publisher.publish(&self.settings.topic, &payload) => Some(result),
                    }
                }
                Err(e) => Some(Err(PublishError::Permanent(e.to_string()))),
            };

            match published {
                None => {
                    report.outcome = TickOutcome::Interrupted;
                    return Ok(self.interrupted(report));
                }
                Some(Ok(())) => report.published += 1,
                Some(Err(PublishError::Transient(reason))) => {
                    log::warn!(
                        "Publish of {}@{} failed, will retry: {}",
                        sample.tag,
                        sample.timestamp,
                        reason
                    );
                    self.state = LoopState::Backoff;
                    report.outcome = TickOutcome::Retry;
                    return Ok(report);
                }
                Some(Err(PublishError::Permanent(reason))) => {
                    log::warn!(
                        "Data loss: skipping sample {}@{} that cannot be published: {}",
                        sample.tag,
                        sample.timestamp,
                        reason
                    );
                    report.skipped += 1;
                }
            }

            // The watermark moves once per run of equal timestamps.
            let closes_run = samples
                .get(idx + 1)
                .map_or(true, |next| next.timestamp != sample.timestamp);
            if !closes_run {
                continue;
            }

            self.state = LoopState::Advancing;
            match watermark.advance(sample.timestamp) {
                Ok(()) => log::trace!("Watermark advanced to {}", sample.timestamp),
                Err(WatermarkError::Store(e)) => {
                    log::warn!("Watermark could not be persisted, will retry: {}", e);
                    self.state = LoopState::Backoff;
                    report.outcome = TickOutcome::Retry;
                    return Ok(report);
                }
                Err(e) => {
                    self.state = LoopState::Backoff;
                    return Err(ForwarderError::Invariant(e));
                }
            }
        }

        if report.published > 0 {
            log::debug!("Published {} data points", report.published);
        }
        self.state = LoopState::Idle;
        Ok(report)
    }

    /// Applies the retry policy to a finished tick and returns how long to
    /// wait before the next one.
    pub fn delay_after(&mut self, report: &TickReport) -> Duration {
        match report.outcome {
            TickOutcome::Retry => {
                self.state = LoopState::Backoff;
                self.backoff.next_delay()
            }
            _ => {
                self.backoff.reset();
                self.state = LoopState::Idle;
                self.settings.poll_interval
            }
        }
    }

    fn interrupted(&mut self, report: TickReport) -> TickReport {
        log::info!("Shutdown requested, abandoning current tick");
        self.state = LoopState::Idle;
        report
    }
}

/// Drops anything at or before the watermark and orders the rest by time.
/// The sort is stable, so samples sharing a timestamp keep the historian's
/// order.
fn fresh_samples(samples: Vec<Sample>, since: chrono::DateTime<chrono::Utc>) -> Vec<Sample> {
    let total = samples.len();
    let mut fresh: Vec<Sample> = samples.into_iter().filter(|s| s.timestamp > since).collect();
    if fresh.len() < total {
        log::warn!(
            "Discarded {} samples at or before the watermark {}",
            total - fresh.len(),
            since
        );
    }
    fresh.sort_by_key(|s| s.timestamp);
    fresh
}

fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{PublishResult, StoreError};
    use crate::core::sample::{Quality, SampleValue};
    use crate::core::watermark::{MemoryWatermarkStore, WatermarkSeed};
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::VecDeque;

    const DS: &str = "Plant.Area";
    const TOPIC: &str = "Plant/Area";

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample(tag: &str, secs: i64, value: f64) -> Sample {
        Sample::new(tag, t(secs), SampleValue::Number(value), Quality::Good)
    }

    /// Honours the reader contract over an in-memory history, after replaying
    /// scripted errors.
    #[derive(Default)]
    struct ScriptedReader {
        history: Vec<Sample>,
        errors: VecDeque<ReadError>,
        raw: Option<Vec<Sample>>,
        calls: Vec<DateTime<Utc>>,
    }

    impl HistorianReader for ScriptedReader {
        async fn read_since(&mut self, _dataset_id: &str, since: DateTime<Utc>) -> Result<Vec<Sample>, ReadError> {
            self.calls.push(since);
            if let Some(e) = self.errors.pop_front() {
                return Err(e);
            }
            if let Some(raw) = &self.raw {
                return Ok(raw.clone());
            }
            Ok(self.history.iter().filter(|s| s.timestamp > since).cloned().collect())
        }
    }

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Vec<(String, serde_json::Value)>,
        script: VecDeque<PublishResult>,
    }

    impl RecordingPublisher {
        fn sent_timestamps(&self) -> Vec<String> {
            self.sent
                .iter()
                .map(|(_, p)| p["timestamp"].as_str().unwrap().to_string())
                .collect()
        }
    }

    impl BrokerPublisher for RecordingPublisher {
        async fn publish(&mut self, topic: &str, payload: &[u8]) -> PublishResult {
            let result = self.script.pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                self.sent.push((topic.to_string(), serde_json::from_slice(payload).unwrap()));
            }
            result
        }
    }

    /// Memory store whose next `fail_next` writes fail, as if the process
    /// died right after the publish was acknowledged.
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: MemoryWatermarkStore,
        fail_next: usize,
    }

    impl WatermarkStore for FlakyStore {
        fn load(&self, dataset_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.inner.load(dataset_id)
        }

        fn persist(&mut self, dataset_id: &str, ts: DateTime<Utc>) -> Result<(), StoreError> {
            if self.fail_next > 0 {
                self.fail_next -= 1;
                return Err(StoreError::Io(std::io::Error::other("disk gone")));
            }
            self.inner.persist(dataset_id, ts)
        }
    }

    fn settings() -> ForwardSettings {
        ForwardSettings {
            dataset_id: DS.to_string(),
            topic: TOPIC.to_string(),
            poll_interval: Duration::from_millis(10),
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_millis(40),
            on_permanent_read_error: PermanentErrorPolicy::Exit,
        }
    }

    fn watermark_at(secs: i64) -> Watermark<MemoryWatermarkStore> {
        Watermark::open(DS, MemoryWatermarkStore::new(), WatermarkSeed::At(t(secs))).unwrap()
    }

    #[tokio::test]
    async fn test_two_samples_forwarded_in_order() {
        let reader = ScriptedReader {
            history: vec![sample("A", 1, 5.0), sample("A", 2, 6.0)],
            ..Default::default()
        };
        let mut fl = ForwardLoop::new(reader, RecordingPublisher::default(), settings());
        let mut wm = watermark_at(0);
        let (_tx, mut rx) = broadcast::channel(1);

        let report = fl.tick(&mut wm, &mut rx).await.unwrap();

        assert_eq!(report.outcome, TickOutcome::Completed);
        assert_eq!(report.published, 2);
        assert_eq!(wm.get(), t(2));
        assert_eq!(fl.state(), LoopState::Idle);

        let sent = &fl.publisher().sent;
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(topic, _)| topic == TOPIC));
        assert_eq!(sent[0].1["value"], 5.0);
        assert_eq!(sent[1].1["value"], 6.0);
        assert_eq!(
            fl.publisher().sent_timestamps(),
            vec![t(1).to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true), t(2).to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)]
        );
    }

    #[tokio::test]
    async fn test_empty_read_leaves_watermark_alone() {
        let mut fl = ForwardLoop::new(ScriptedReader::default(), RecordingPublisher::default(), settings());
        let mut wm = watermark_at(0);
        let (_tx, mut rx) = broadcast::channel(1);

        let report = fl.tick(&mut wm, &mut rx).await.unwrap();

        assert_eq!(report.outcome, TickOutcome::Empty);
        assert!(fl.publisher().sent.is_empty());
        assert_eq!(wm.get(), t(0));
    }

    #[tokio::test]
    async fn test_next_tick_reads_after_advanced_watermark() {
        let reader = ScriptedReader {
            history: vec![sample("A", 1, 1.0), sample("A", 2, 2.0)],
            ..Default::default()
        };
        let mut fl = ForwardLoop::new(reader, RecordingPublisher::default(), settings());
        let mut wm = watermark_at(0);
        let (_tx, mut rx) = broadcast::channel(1);

        fl.tick(&mut wm, &mut rx).await.unwrap();
        let second = fl.tick(&mut wm, &mut rx).await.unwrap();

        assert_eq!(fl.reader().calls, vec![t(0), t(2)]);
        assert_eq!(second.outcome, TickOutcome::Empty);
        assert_eq!(fl.publisher().sent.len(), 2);
    }

    #[tokio::test]
    async fn test_transient_read_error_backs_off_then_resets() {
        let reader = ScriptedReader {
            history: vec![sample("A", 1, 1.0)],
            errors: VecDeque::from(vec![
                ReadError::Transient("timeout".into()),
                ReadError::Transient("503".into()),
            ]),
            ..Default::default()
        };
        let mut fl = ForwardLoop::new(reader, RecordingPublisher::default(), settings());
        let mut wm = watermark_at(0);
        let (_tx, mut rx) = broadcast::channel(1);

        let first = fl.tick(&mut wm, &mut rx).await.unwrap();
        assert_eq!(first.outcome, TickOutcome::Retry);
        assert_eq!(fl.state(), LoopState::Backoff);
        assert_eq!(fl.delay_after(&first), Duration::from_millis(5));

        let second = fl.tick(&mut wm, &mut rx).await.unwrap();
        assert_eq!(fl.delay_after(&second), Duration::from_millis(10));
        assert_eq!(wm.get(), t(0));

        let third = fl.tick(&mut wm, &mut rx).await.unwrap();
        assert_eq!(third.outcome, TickOutcome::Completed);
        assert_eq!(fl.delay_after(&third), Duration::from_millis(10));
        assert_eq!(fl.backoff().failures(), 0);
        assert_eq!(fl.backoff().peek(), Duration::from_millis(5));
        assert_eq!(wm.get(), t(1));
    }

    #[tokio::test]
    async fn test_transient_publish_error_retries_same_sample() {
        let reader = ScriptedReader {
            history: vec![sample("A", 1, 1.0), sample("A", 2, 2.0), sample("A", 3, 3.0)],
            ..Default::default()
        };
        let publisher = RecordingPublisher {
            script: VecDeque::from(vec![Ok(()), Err(PublishError::Transient("connection reset".into()))]),
            ..Default::default()
        };
        let mut fl = ForwardLoop::new(reader, publisher, settings());
        let mut wm = watermark_at(0);
        let (_tx, mut rx) = broadcast::channel(1);

        let first = fl.tick(&mut wm, &mut rx).await.unwrap();
        assert_eq!(first.outcome, TickOutcome::Retry);
        assert_eq!(first.published, 1);
        assert_eq!(wm.get(), t(1));

        let second = fl.tick(&mut wm, &mut rx).await.unwrap();
        assert_eq!(second.outcome, TickOutcome::Completed);
        assert_eq!(fl.reader().calls[1], t(1));

        let values: Vec<f64> = fl.publisher().sent.iter().map(|(_, p)| p["value"].as_f64().unwrap()).collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
        assert_eq!(wm.get(), t(3));
    }

    #[tokio::test]
    async fn test_malformed_sample_is_skipped_without_stalling() {
        let malformed = Sample::new("A", t(1), SampleValue::Number(f64::NAN), Quality::Bad);
        let reader = ScriptedReader {
            history: vec![malformed, sample("A", 2, 6.0)],
            ..Default::default()
        };
        let mut fl = ForwardLoop::new(reader, RecordingPublisher::default(), settings());
        let mut wm = watermark_at(0);
        let (_tx, mut rx) = broadcast::channel(1);

        let report = fl.tick(&mut wm, &mut rx).await.unwrap();

        assert_eq!(report.outcome, TickOutcome::Completed);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.published, 1);
        assert_eq!(fl.publisher().sent.len(), 1);
        assert_eq!(fl.publisher().sent[0].1["value"], 6.0);
        assert_eq!(wm.get(), t(2));
    }

    #[tokio::test]
    async fn test_permanent_publish_error_advances_past_sample() {
        let reader = ScriptedReader {
            history: vec![sample("A", 1, 1.0), sample("A", 2, 2.0)],
            ..Default::default()
        };
        let publisher = RecordingPublisher {
            script: VecDeque::from(vec![Err(PublishError::Permanent("payload too large".into()))]),
            ..Default::default()
        };
        let mut fl = ForwardLoop::new(reader, publisher, settings());
        let mut wm = watermark_at(0);
        let (_tx, mut rx) = broadcast::channel(1);

        let report = fl.tick(&mut wm, &mut rx).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(fl.publisher().sent.len(), 1);
        assert_eq!(wm.get(), t(2));
    }

    #[tokio::test]
    async fn test_duplicate_timestamps_forwarded_and_advanced_once() {
        let reader = ScriptedReader {
            history: vec![sample("A", 1, 1.0), sample("B", 1, 2.0), sample("A", 2, 3.0)],
            ..Default::default()
        };
        let mut fl = ForwardLoop::new(reader, RecordingPublisher::default(), settings());
        let mut wm = watermark_at(0);
        let (_tx, mut rx) = broadcast::channel(1);

        let report = fl.tick(&mut wm, &mut rx).await.unwrap();

        assert_eq!(report.published, 3);
        assert_eq!(wm.get(), t(2));
        let tags: Vec<&str> = fl.publisher().sent.iter().map(|(_, p)| p["tag"].as_str().unwrap()).collect();
        assert_eq!(tags, vec!["A", "B", "A"]);
    }

    #[tokio::test]
    async fn test_failure_inside_timestamp_run_rereads_whole_run() {
        let reader = ScriptedReader {
            history: vec![sample("A", 1, 1.0), sample("B", 1, 2.0)],
            ..Default::default()
        };
        let publisher = RecordingPublisher {
            script: VecDeque::from(vec![Ok(()), Err(PublishError::Transient("ack timeout".into()))]),
            ..Default::default()
        };
        let mut fl = ForwardLoop::new(reader, publisher, settings());
        let mut wm = watermark_at(0);
        let (_tx, mut rx) = broadcast::channel(1);

        let first = fl.tick(&mut wm, &mut rx).await.unwrap();
        assert_eq!(first.outcome, TickOutcome::Retry);
        assert_eq!(wm.get(), t(0));

        fl.tick(&mut wm, &mut rx).await.unwrap();
        let tags: Vec<&str> = fl.publisher().sent.iter().map(|(_, p)| p["tag"].as_str().unwrap()).collect();
        assert_eq!(tags, vec!["A", "A", "B"]);
        assert_eq!(wm.get(), t(1));
    }

    #[tokio::test]
    async fn test_sample_at_watermark_is_discarded() {
        let reader = ScriptedReader {
            raw: Some(vec![sample("A", 0, 1.0), sample("A", 1, 2.0)]),
            ..Default::default()
        };
        let mut fl = ForwardLoop::new(reader, RecordingPublisher::default(), settings());
        let mut wm = watermark_at(0);
        let (_tx, mut rx) = broadcast::channel(1);

        let report = fl.tick(&mut wm, &mut rx).await.unwrap();

        assert_eq!(report.read, 1);
        assert_eq!(fl.publisher().sent.len(), 1);
        assert_eq!(fl.publisher().sent[0].1["value"], 2.0);
        assert_eq!(wm.get(), t(1));
    }

    #[tokio::test]
    async fn test_crash_between_publish_and_advance_redelivers() {
        let history = vec![sample("A", 1, 1.0)];
        let store = FlakyStore::default();
        let mut wm = Watermark::open(DS, store, WatermarkSeed::At(t(0))).unwrap();

        // The publish is acknowledged, then the watermark write is lost.
        let mut crashing = wm.into_store();
        crashing.fail_next = 1;
        let mut wm = Watermark::open(DS, crashing, WatermarkSeed::Now).unwrap();
        let reader = ScriptedReader {
            history: history.clone(),
            ..Default::default()
        };
        let mut first_run = ForwardLoop::new(reader, RecordingPublisher::default(), settings());
        let (_tx, mut rx) = broadcast::channel(1);
        let report = first_run.tick(&mut wm, &mut rx).await.unwrap();
        assert_eq!(report.outcome, TickOutcome::Retry);
        assert_eq!(report.published, 1);

        // Restart from whatever the store holds.
        let restarted_store = wm.into_store();
        let mut wm = Watermark::open(DS, restarted_store, WatermarkSeed::Now).unwrap();
        assert_eq!(wm.get(), t(0));

        let reader = ScriptedReader {
            history,
            ..Default::default()
        };
        let mut second_run = ForwardLoop::new(reader, RecordingPublisher::default(), settings());
        second_run.tick(&mut wm, &mut rx).await.unwrap();

        let first_sent = &first_run.publisher().sent;
        let second_sent = &second_run.publisher().sent;
        assert_eq!(first_sent.len(), 1);
        assert_eq!(second_sent.len(), 1);
        assert_eq!(first_sent[0].1, second_sent[0].1);
        assert_eq!(wm.get(), t(1));
    }

    #[tokio::test]
    async fn test_permanent_read_error_is_fatal_by_default() {
        let reader = ScriptedReader {
            errors: VecDeque::from(vec![ReadError::Permanent("dataset not found".into())]),
            ..Default::default()
        };
        let mut fl = ForwardLoop::new(reader, RecordingPublisher::default(), settings());
        let mut wm = watermark_at(0);
        let (_tx, mut rx) = broadcast::channel(1);

        let result = fl.run(&mut wm, &mut rx).await;

        assert!(matches!(result, Err(ForwarderError::PermanentRead(_))));
        assert_eq!(fl.reader().calls.len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_read_error_can_pause_until_shutdown() {
        let reader = ScriptedReader {
            errors: VecDeque::from(vec![ReadError::Permanent("auth rejected".into())]),
            ..Default::default()
        };
        let mut cfg = settings();
        cfg.on_permanent_read_error = PermanentErrorPolicy::Pause;
        let mut fl = ForwardLoop::new(reader, RecordingPublisher::default(), cfg);
        let mut wm = watermark_at(0);
        let (tx, mut rx) = broadcast::channel(1);

        let (result, _) = tokio::join!(fl.run(&mut wm, &mut rx), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(()).unwrap();
        });

        assert!(result.is_ok());
        assert_eq!(fl.reader().calls.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let reader = ScriptedReader {
            history: vec![sample("A", 1, 1.0)],
            ..Default::default()
        };
        let mut fl = ForwardLoop::new(reader, RecordingPublisher::default(), settings());
        let mut wm = watermark_at(0);
        let (tx, mut rx) = broadcast::channel(1);

        let (result, _) = tokio::join!(fl.run(&mut wm, &mut rx), async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            tx.send(()).unwrap();
        });

        assert!(result.is_ok());
        assert!(fl.reader().calls.len() >= 2);
        assert_eq!(fl.publisher().sent.len(), 1);
        assert_eq!(fl.state(), LoopState::Idle);
        assert_eq!(wm.get(), t(1));
    }

    #[tokio::test]
    async fn test_pending_shutdown_abandons_tick_before_publishing() {
        let reader = ScriptedReader {
            history: vec![sample("A", 1, 1.0)],
            ..Default::default()
        };
        let mut fl = ForwardLoop::new(reader, RecordingPublisher::default(), settings());
        let mut wm = watermark_at(0);
        let (tx, mut rx) = broadcast::channel(1);
        tx.send(()).unwrap();

        let report = fl.tick(&mut wm, &mut rx).await.unwrap();

        assert_eq!(report.outcome, TickOutcome::Interrupted);
        assert!(fl.publisher().sent.is_empty());
        assert_eq!(wm.get(), t(0));
    }
}

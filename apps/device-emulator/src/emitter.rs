use crate::config::{CadenceMode, DeviceConfig, IntervalBand};
use crate::generator::generate_value;
use crate::publisher::{Attributes, PublishError, Publisher, ATTR_DEVICE_ID, ATTR_DEVICE_TYPE};
use crate::reading::Reading;
use crate::run_state::RunState;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Everything the per-device loops share.
#[derive(Clone)]
pub struct EmitterContext {
    pub run_state: Arc<RunState>,
    pub publisher: Arc<dyn Publisher>,
    pub topic: String,
    pub publish_timeout: Duration,
    pub cadence: CadenceMode,
    pub band: IntervalBand,
}

#[derive(Debug, Default)]
pub struct DeviceStats {
    published: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    paused_ticks: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl DeviceStats {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn paused_ticks(&self) -> u64 {
        self.paused_ticks.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    fn record_failure(&self, err: impl Into<String>) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub kind: String,
    pub location: String,
    pub interval_ms: u64,
    pub published: u64,
    pub failed: u64,
    pub skipped: u64,
    pub paused_ticks: u64,
    pub last_error: Option<String>,
}

/// Read side of a running emitter, kept by the HTTP layer.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub device: DeviceConfig,
    pub stats: Arc<DeviceStats>,
}

impl DeviceHandle {
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            device_id: self.device.id.clone(),
            kind: self.device.kind.to_string(),
            location: self.device.location.clone(),
            interval_ms: self.device.interval_ms,
            published: self.stats.published(),
            failed: self.stats.failed(),
            skipped: self.stats.skipped(),
            paused_ticks: self.stats.paused_ticks(),
            last_error: self.stats.last_error(),
        }
    }
}

pub struct Emitter {
    device: DeviceConfig,
    ctx: EmitterContext,
    stats: Arc<DeviceStats>,
    attributes: Attributes,
    rng: StdRng,
}

impl Emitter {
    pub fn new(device: DeviceConfig, ctx: EmitterContext) -> Self {
        let mut attributes = Attributes::new();
        attributes.insert(ATTR_DEVICE_TYPE.to_string(), device.kind.to_string());
        attributes.insert(ATTR_DEVICE_ID.to_string(), device.id.clone());
        Self {
            device,
            ctx,
            stats: Arc::new(DeviceStats::default()),
            attributes,
            rng: StdRng::from_entropy(),
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            device: self.device.clone(),
            stats: self.stats.clone(),
        }
    }

    /// Runs until `cancel` fires. Publish failures never end the loop.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            device_id = %self.device.id,
            kind = %self.device.kind,
            interval_ms = self.device.interval_ms,
            cadence = ?self.ctx.cadence,
            "emitter started"
        );

        let interval = self.device.interval();
        let mut deadline = Instant::now();
        while !cancel.is_cancelled() {
            let started = Instant::now();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.tick() => {}
            }

            let delay = match self.ctx.cadence {
                CadenceMode::Fixed => interval.saturating_sub(started.elapsed()),
                CadenceMode::Deadline => {
                    deadline += interval;
                    let now = Instant::now();
                    if deadline < now {
                        // Behind schedule: restart from now rather than bursting.
                        deadline = now;
                    }
                    deadline - now
                }
                CadenceMode::Jitter => {
                    let target = Duration::from_millis(
                        self.rng.gen_range(self.ctx.band.min_ms..=self.ctx.band.max_ms),
                    );
                    target.saturating_sub(started.elapsed())
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        tracing::info!(device_id = %self.device.id, "emitter stopped");
    }

    async fn tick(&mut self) {
        if !self.ctx.run_state.is_emitting() {
            self.stats.paused_ticks.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let value = self
            .device
            .range
            .as_ref()
            .and_then(|range| generate_value(&self.device.kind, range, &mut self.rng));
        let Some(value) = value else {
            self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(device_id = %self.device.id, kind = %self.device.kind, "no value for kind; skipping tick");
            return;
        };

        let reading = Reading::new(&self.device, value, Utc::now());
        let payload = match reading.encode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(device_id = %self.device.id, error = %err, "failed to encode reading");
                self.stats.record_failure(err.to_string());
                return;
            }
        };

        let publish = self
            .ctx
            .publisher
            .publish(&self.ctx.topic, payload, &self.attributes);
        let result = match timeout(self.ctx.publish_timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.ctx.publish_timeout)),
        };

        match result {
            Ok(message_id) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    device_id = %self.device.id,
                    kind = %self.device.kind,
                    value = %reading.value(),
                    emitted_at = %reading.emitted_at(),
                    message_id = %message_id,
                    "published reading"
                );
            }
            Err(err) => {
                tracing::warn!(device_id = %self.device.id, error = %err, "failed to publish reading");
                self.stats.record_failure(err.to_string());
            }
        }
    }
}

/// Starts one emitter task per device. All of them stop when `cancel` fires.
pub fn spawn_emitters(
    devices: &[DeviceConfig],
    ctx: &EmitterContext,
    cancel: &CancellationToken,
) -> (Vec<DeviceHandle>, Vec<JoinHandle<()>>) {
    let mut handles = Vec::with_capacity(devices.len());
    let mut tasks = Vec::with_capacity(devices.len());
    for device in devices {
        let emitter = Emitter::new(device.clone(), ctx.clone());
        handles.push(emitter.handle());
        tasks.push(tokio::spawn(emitter.run(cancel.clone())));
    }
    (handles, tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{SensorKind, ValueRange};
    use async_trait::async_trait;

    #[derive(Debug, Clone)]
    struct Call {
        topic: String,
        payload: serde_json::Value,
        attributes: Attributes,
        at: Instant,
    }

    #[derive(Default)]
    struct RecordingPublisher {
        calls: Mutex<Vec<Call>>,
        latency: Duration,
    }

    impl RecordingPublisher {
        fn with_latency(latency: Duration) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                latency,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            attributes: &Attributes,
        ) -> Result<String, PublishError> {
            let at = Instant::now();
            if !self.latency.is_zero() {
                sleep(self.latency).await;
            }
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                topic: topic.to_string(),
                payload: serde_json::from_slice(&payload).unwrap(),
                attributes: attributes.clone(),
                at,
            });
            Ok(format!("msg-{}", calls.len()))
        }
    }

    struct FailingPublisher;

    #[async_trait]
    impl Publisher for FailingPublisher {
        async fn publish(
            &self,
            _topic: &str,
            _payload: Vec<u8>,
            _attributes: &Attributes,
        ) -> Result<String, PublishError> {
            Err(PublishError::Other("broker unavailable".to_string()))
        }
    }

    struct HangingPublisher;

    #[async_trait]
    impl Publisher for HangingPublisher {
        async fn publish(
            &self,
            _topic: &str,
            _payload: Vec<u8>,
            _attributes: &Attributes,
        ) -> Result<String, PublishError> {
            std::future::pending().await
        }
    }

    fn device(kind: SensorKind, interval_ms: u64) -> DeviceConfig {
        let range = kind.default_range();
        DeviceConfig {
            id: format!("{kind}-1"),
            kind,
            location: "lab".to_string(),
            interval_ms,
            range,
        }
    }

    fn context(publisher: Arc<dyn Publisher>, cadence: CadenceMode) -> EmitterContext {
        EmitterContext {
            run_state: Arc::new(RunState::default()),
            publisher,
            topic: "iot/readings".to_string(),
            publish_timeout: Duration::from_millis(200),
            cadence,
            band: IntervalBand::default(),
        }
    }

    fn gaps(calls: &[Call]) -> Vec<Duration> {
        calls.windows(2).map(|w| w[1].at - w[0].at).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn emits_at_configured_interval() {
        let publisher = Arc::new(RecordingPublisher::default());
        let ctx = context(publisher.clone(), CadenceMode::Fixed);
        let cancel = CancellationToken::new();
        let emitter = Emitter::new(device(SensorKind::Temperature, 50), ctx);
        let handle = emitter.handle();
        let task = tokio::spawn(emitter.run(cancel.clone()));

        sleep(Duration::from_millis(1_000)).await;
        cancel.cancel();
        task.await.unwrap();

        let calls = publisher.calls();
        assert!((20..=21).contains(&calls.len()), "got {} calls", calls.len());
        for gap in gaps(&calls) {
            assert!(gap >= Duration::from_millis(50), "gap {gap:?} shorter than interval");
        }
        assert_eq!(handle.stats.published() as usize, calls.len());

        let first = &calls[0];
        assert_eq!(first.topic, "iot/readings");
        assert_eq!(first.attributes.get(ATTR_DEVICE_TYPE).unwrap(), "temperature");
        assert_eq!(first.payload["device_id"], "temperature-1");
        assert_eq!(first.payload["unit"], "°C");
        let value = first.payload["value"].as_f64().unwrap();
        assert!((15.0..=30.0).contains(&value));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_publisher_runs_back_to_back_without_catch_up() {
        let publisher = Arc::new(RecordingPublisher::with_latency(Duration::from_millis(70)));
        let ctx = context(publisher.clone(), CadenceMode::Fixed);
        let cancel = CancellationToken::new();
        let emitter = Emitter::new(device(SensorKind::Humidity, 50), ctx);
        let task = tokio::spawn(emitter.run(cancel.clone()));

        sleep(Duration::from_millis(700)).await;
        cancel.cancel();
        task.await.unwrap();

        for gap in gaps(&publisher.calls()) {
            assert_eq!(gap, Duration::from_millis(70));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cadence_fires_on_absolute_schedule() {
        let publisher = Arc::new(RecordingPublisher::with_latency(Duration::from_millis(10)));
        let ctx = context(publisher.clone(), CadenceMode::Deadline);
        let cancel = CancellationToken::new();
        let origin = Instant::now();
        let emitter = Emitter::new(device(SensorKind::Light, 40), ctx);
        let task = tokio::spawn(emitter.run(cancel.clone()));

        sleep(Duration::from_millis(400)).await;
        cancel.cancel();
        task.await.unwrap();

        let calls = publisher.calls();
        assert!(calls.len() >= 9);
        for (k, call) in calls.iter().enumerate() {
            assert_eq!(call.at - origin, Duration::from_millis(40 * k as u64));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_cadence_stays_inside_band() {
        let publisher = Arc::new(RecordingPublisher::default());
        let ctx = context(publisher.clone(), CadenceMode::Jitter);
        let cancel = CancellationToken::new();
        let emitter = Emitter::new(device(SensorKind::Light, 100), ctx);
        let task = tokio::spawn(emitter.run(cancel.clone()));

        sleep(Duration::from_millis(2_000)).await;
        cancel.cancel();
        task.await.unwrap();

        let gaps = gaps(&publisher.calls());
        assert!(gaps.len() >= 19);
        for gap in gaps {
            assert!(gap >= Duration::from_millis(20) && gap <= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pause_stops_publishing_until_resumed() {
        let publisher = Arc::new(RecordingPublisher::default());
        let ctx = context(publisher.clone(), CadenceMode::Fixed);
        let run_state = ctx.run_state.clone();
        let cancel = CancellationToken::new();
        let emitter = Emitter::new(device(SensorKind::Temperature, 50), ctx);
        let handle = emitter.handle();
        let task = tokio::spawn(emitter.run(cancel.clone()));

        sleep(Duration::from_millis(120)).await;
        run_state.pause();
        // Let any tick already past its check finish.
        sleep(Duration::from_millis(60)).await;
        let paused_at = publisher.count();

        sleep(Duration::from_millis(500)).await;
        assert_eq!(publisher.count(), paused_at);
        assert!(handle.stats.paused_ticks() >= 9);

        run_state.resume();
        sleep(Duration::from_millis(51)).await;
        assert!(publisher.count() > paused_at, "no publish within one tick of resume");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_kind_skips_without_publishing() {
        let publisher = Arc::new(RecordingPublisher::default());
        let ctx = context(publisher.clone(), CadenceMode::Fixed);
        let cancel = CancellationToken::new();
        let emitter = Emitter::new(
            device(SensorKind::Unknown("pressure".to_string()), 20),
            ctx,
        );
        let handle = emitter.handle();
        let task = tokio::spawn(emitter.run(cancel.clone()));

        sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(publisher.count(), 0);
        assert!(handle.stats.skipped() >= 10);
        assert_eq!(handle.stats.failed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn publish_errors_are_counted_and_loop_continues() {
        let ctx = context(Arc::new(FailingPublisher), CadenceMode::Fixed);
        let cancel = CancellationToken::new();
        let emitter = Emitter::new(device(SensorKind::Humidity, 20), ctx);
        let handle = emitter.handle();
        let task = tokio::spawn(emitter.run(cancel.clone()));

        sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(handle.stats.failed() >= 10);
        assert_eq!(handle.stats.published(), 0);
        assert!(handle.stats.last_error().unwrap().contains("broker unavailable"));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_publish_times_out_as_failure() {
        let ctx = context(Arc::new(HangingPublisher), CadenceMode::Fixed);
        let cancel = CancellationToken::new();
        let emitter = Emitter::new(device(SensorKind::Temperature, 50), ctx);
        let handle = emitter.handle();
        let task = tokio::spawn(emitter.run(cancel.clone()));

        sleep(Duration::from_millis(650)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(handle.stats.failed(), 3);
        assert!(handle.stats.last_error().unwrap().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_emitters_are_independent_and_cancel_together() {
        let publisher = Arc::new(RecordingPublisher::default());
        let ctx = context(publisher.clone(), CadenceMode::Fixed);
        let cancel = CancellationToken::new();
        let devices = vec![
            device(SensorKind::Temperature, 20),
            device(SensorKind::Humidity, 100),
        ];
        let (handles, tasks) = spawn_emitters(&devices, &ctx, &cancel);

        sleep(Duration::from_millis(1_000)).await;
        cancel.cancel();
        for task in tasks {
            task.await.unwrap();
        }

        let fast = handles[0].stats.published();
        let slow = handles[1].stats.published();
        assert!((50..=51).contains(&fast), "fast device published {fast}");
        assert!((10..=11).contains(&slow), "slow device published {slow}");
        assert_eq!(publisher.count() as u64, fast + slow);
        assert_eq!(handles[1].status().kind, "humidity");
    }
}

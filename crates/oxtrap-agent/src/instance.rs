use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use oxtrap_check::MetricSink;
use oxtrap_cloud::collector::{CollectContext, Collector};
use oxtrap_cloud::error::CollectError;
use oxtrap_cloud::MetricsApi;
use oxtrap_common::types::{Tags, TimeWindow};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

/// The scheduler wakes this often and decides whether a run is due.
pub const TICK: std::time::Duration = std::time::Duration::from_secs(60);

/// A run is due this long before a full period has elapsed.
const TOLERANCE_SECS: i64 = 5;
/// Window used when there is no previous run.
const FALLBACK_WINDOW_MINS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    NotDue,
    /// The previous run has not finished.
    InProgress,
    Run(TimeWindow),
}

/// Decides when a collection is due and over which window.
#[derive(Debug)]
pub struct Schedule {
    period_secs: i64,
    last_run_start: Option<DateTime<Utc>>,
    running: bool,
}

impl Schedule {
    pub fn new(period_secs: i64) -> Self {
        Self {
            period_secs,
            last_run_start: None,
            running: false,
        }
    }

    /// Marks a run as started when one is due.
    ///
    /// The window ends now and reaches back one period past the last run
    /// start, so a delayed run widens its window instead of leaving a gap.
    pub fn on_wake(&mut self, now: DateTime<Utc>) -> Wake {
        let period = Duration::seconds(self.period_secs);
        if let Some(last) = self.last_run_start {
            if now - last < period - Duration::seconds(TOLERANCE_SECS) {
                return Wake::NotDue;
            }
        }
        if self.is_running() {
            return Wake::InProgress;
        }

        let start = match self.last_run_start {
            Some(last) => now - ((now - last) + period),
            None => now - Duration::minutes(FALLBACK_WINDOW_MINS),
        };
        self.running = true;
        self.last_run_start = Some(now);

        Wake::Run(TimeWindow {
            start,
            end: now,
            granularity_secs: self.period_secs,
        })
    }

    pub fn finish(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// Collectors and destination of one account region.
pub struct Pipeline {
    pub account: String,
    pub region: String,
    pub api: Arc<dyn MetricsApi>,
    pub sink: Arc<dyn MetricSink>,
    pub collectors: Mutex<Vec<Box<dyn Collector>>>,
    pub base_tags: Tags,
}

impl Pipeline {
    /// Runs every collector in order against one shared buffer, submitting
    /// and resetting it after each. A failing collector is reported and the
    /// next one still runs.
    pub async fn collect_all(&self, window: &TimeWindow, cancel: &CancellationToken) {
        let mut collectors = self.collectors.lock().await;
        let mut buf = self.sink.new_buffer();

        for collector in collectors.iter_mut() {
            if cancel.is_cancelled() {
                break;
            }

            let ctx = CollectContext {
                api: self.api.as_ref(),
                sink: self.sink.as_ref(),
                window,
                base_tags: &self.base_tags,
                cancel,
                now: Utc::now(),
            };
            if let Err(e) = collector.collect(&ctx, &mut buf).await {
                tracing::error!(
                    account = %self.account,
                    region = %self.region,
                    collector = %collector.id(),
                    error = %e,
                    "collecting metrics"
                );
                self.sink.report_error(&e).await;
            }

            if let Err(e) = self.sink.submit(&buf).await {
                let err = CollectError::Submit {
                    collector: collector.id().to_string(),
                    source: e,
                };
                tracing::error!(account = %self.account, region = %self.region, error = %err, "submitting");
                self.sink.report_error(&err).await;
            }
            buf.reset();
        }
    }
}

/// One account region's polling loop.
pub struct CollectionInstance {
    pipeline: Arc<Pipeline>,
    schedule: Arc<Mutex<Schedule>>,
}

impl CollectionInstance {
    pub fn new(pipeline: Pipeline, period_secs: i64) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            schedule: Arc::new(Mutex::new(Schedule::new(period_secs))),
        }
    }

    /// Runs until `cancel` fires. Collection runs are spawned so a long run
    /// never delays the next wake. On cancellation the in-flight run is
    /// awaited before returning.
    pub async fn start(self, cancel: CancellationToken) {
        tracing::info!(
            account = %self.pipeline.account,
            region = %self.pipeline.region,
            "starting collection instance"
        );
        let mut tick = interval(TICK);
        let mut in_flight: Option<JoinHandle<()>> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    if let Some(run) = self.wake(&cancel).await {
                        if let Some(previous) = in_flight.replace(run) {
                            let _ = previous.await;
                        }
                    }
                }
            }
        }

        if let Some(run) = in_flight.take() {
            tracing::info!(
                account = %self.pipeline.account,
                region = %self.pipeline.region,
                "waiting for in-flight collection"
            );
            let _ = run.await;
        }
        tracing::info!(
            account = %self.pipeline.account,
            region = %self.pipeline.region,
            "stopping collection instance"
        );
    }

    /// Spawns a run when one is due. The returned task ends once the run has
    /// finished and the schedule has been released, even if the run panicked.
    async fn wake(&self, cancel: &CancellationToken) -> Option<JoinHandle<()>> {
        let wake = self.schedule.lock().await.on_wake(Utc::now());
        let window = match wake {
            Wake::NotDue => return None,
            Wake::InProgress => {
                tracing::warn!(
                    account = %self.pipeline.account,
                    region = %self.pipeline.region,
                    "previous collection still running, skipping"
                );
                return None;
            }
            Wake::Run(window) => window,
        };

        let pipeline = Arc::clone(&self.pipeline);
        let schedule = Arc::clone(&self.schedule);
        let cancel = cancel.clone();
        let run = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.collect_all(&window, &cancel).await }
        });

        Some(tokio::spawn(async move {
            let started = Utc::now();
            let result = run.await;
            schedule.lock().await.finish();
            match result {
                Ok(()) => tracing::info!(
                    account = %pipeline.account,
                    region = %pipeline.region,
                    duration_ms = (Utc::now() - started).num_milliseconds(),
                    "collection run complete"
                ),
                Err(e) => tracing::error!(
                    account = %pipeline.account,
                    region = %pipeline.region,
                    error = %e,
                    "collection run aborted"
                ),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use oxtrap_check::MetricBuffer;
    use oxtrap_cloud::error::{ProviderError, Result as ProviderResult};
    use oxtrap_cloud::{BatchPage, BatchQuery, Datapoint, Resource, StatisticsQuery};
    use oxtrap_common::types::{MetricDefinition, MetricType, MetricValue};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn should_use_fallback_window_on_first_run() {
        let mut schedule = Schedule::new(60);
        match schedule.on_wake(at(0)) {
            Wake::Run(window) => {
                assert_eq!(window.end, at(0));
                assert_eq!(window.span(), Duration::minutes(10));
                assert_eq!(window.granularity_secs, 60);
            }
            other => panic!("expected a run, got {other:?}"),
        }
        assert!(schedule.is_running());
    }

    #[test]
    fn should_never_overlap_runs() {
        let mut schedule = Schedule::new(60);
        assert!(matches!(schedule.on_wake(at(0)), Wake::Run(_)));
        assert_eq!(schedule.on_wake(at(10)), Wake::NotDue);
        assert_eq!(schedule.on_wake(at(60)), Wake::InProgress);
        assert_eq!(schedule.on_wake(at(120)), Wake::InProgress);

        schedule.finish();
        assert!(matches!(schedule.on_wake(at(180)), Wake::Run(_)));
    }

    #[test]
    fn should_widen_window_after_a_delayed_run() {
        let mut schedule = Schedule::new(60);
        schedule.on_wake(at(0));
        schedule.finish();

        assert_eq!(schedule.on_wake(at(50)), Wake::NotDue);
        match schedule.on_wake(at(56)) {
            Wake::Run(window) => {
                assert_eq!(window.end, at(56));
                assert_eq!(window.start, at(-60));
            }
            other => panic!("expected a run, got {other:?}"),
        }
        schedule.finish();

        match schedule.on_wake(at(56 + 300)) {
            Wake::Run(window) => assert_eq!(window.span(), Duration::seconds(360)),
            other => panic!("expected a run, got {other:?}"),
        }
    }

    struct NullApi;

    #[async_trait]
    impl MetricsApi for NullApi {
        fn name(&self) -> &str {
            "null"
        }

        async fn list_resources(&self, _namespace: &str, _dimension: &str) -> ProviderResult<Vec<Resource>> {
            Ok(vec![])
        }

        async fn get_statistics(&self, _query: &StatisticsQuery) -> ProviderResult<Vec<Datapoint>> {
            Ok(vec![])
        }

        async fn get_metric_data(&self, _query: &BatchQuery) -> ProviderResult<BatchPage> {
            Ok(BatchPage::default())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        submitted: StdMutex<Vec<usize>>,
        errors: StdMutex<Vec<String>>,
        trace: bool,
        traced: StdMutex<Vec<bool>>,
    }

    #[async_trait]
    impl MetricSink for RecordingSink {
        async fn submit(&self, buf: &MetricBuffer) -> oxtrap_check::Result<()> {
            if !buf.is_empty() {
                self.submitted.lock().unwrap().push(buf.len());
                self.traced.lock().unwrap().push(buf.is_traced());
            }
            Ok(())
        }

        async fn report_error(&self, err: &(dyn std::error::Error + Send + Sync)) {
            self.errors.lock().unwrap().push(err.to_string());
        }

        fn new_buffer(&self) -> MetricBuffer {
            MetricBuffer::with_trace(self.trace)
        }
    }

    struct StubCollector {
        id: String,
        samples: usize,
        fail: bool,
    }

    #[async_trait]
    impl Collector for StubCollector {
        fn id(&self) -> &str {
            &self.id
        }

        fn default_metrics(&self) -> Vec<MetricDefinition> {
            vec![]
        }

        async fn collect(
            &mut self,
            ctx: &CollectContext<'_>,
            buf: &mut MetricBuffer,
        ) -> std::result::Result<(), CollectError> {
            for i in 0..self.samples {
                buf.write_sample(
                    &format!("{}_{i}", self.id),
                    MetricType::Float64,
                    &MetricValue::Float(1.0),
                    Some(ctx.window.end),
                )
                .unwrap();
            }
            if self.fail {
                return Err(CollectError::Provider {
                    collector: self.id.clone(),
                    source: ProviderError::RateLimited {
                        provider: "null".to_string(),
                    },
                });
            }
            Ok(())
        }
    }

    fn pipeline(sink: Arc<RecordingSink>, collectors: Vec<Box<dyn Collector>>) -> Pipeline {
        Pipeline {
            account: "acme".to_string(),
            region: "us-east-1".to_string(),
            api: Arc::new(NullApi),
            sink,
            collectors: Mutex::new(collectors),
            base_tags: vec![],
        }
    }

    #[tokio::test]
    async fn should_isolate_failing_collector_and_submit_each_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let collectors: Vec<Box<dyn Collector>> = vec![
            Box::new(StubCollector { id: "first".to_string(), samples: 2, fail: false }),
            Box::new(StubCollector { id: "broken".to_string(), samples: 1, fail: true }),
            Box::new(StubCollector { id: "last".to_string(), samples: 3, fail: false }),
        ];
        let pipeline = pipeline(Arc::clone(&sink), collectors);
        let window = TimeWindow {
            start: at(-600),
            end: at(0),
            granularity_secs: 60,
        };

        pipeline.collect_all(&window, &CancellationToken::new()).await;

        assert_eq!(*sink.submitted.lock().unwrap(), vec![2, 1, 3]);
        let errors = sink.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("broken"));
    }

    #[tokio::test]
    async fn should_not_collect_once_cancelled() {
        let sink = Arc::new(RecordingSink::default());
        let collectors: Vec<Box<dyn Collector>> = vec![Box::new(StubCollector {
            id: "only".to_string(),
            samples: 1,
            fail: false,
        })];
        let pipeline = pipeline(Arc::clone(&sink), collectors);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let window = TimeWindow {
            start: at(-600),
            end: at(0),
            granularity_secs: 60,
        };
        pipeline.collect_all(&window, &cancel).await;
        assert!(sink.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_run_first_collection_and_stop_on_cancel() {
        let sink = Arc::new(RecordingSink::default());
        let collectors: Vec<Box<dyn Collector>> = vec![Box::new(StubCollector {
            id: "only".to_string(),
            samples: 1,
            fail: false,
        })];
        let instance = CollectionInstance::new(pipeline(Arc::clone(&sink), collectors), 300);
        let schedule = Arc::clone(&instance.schedule);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(instance.start(cancel.clone()));

        for _ in 0..100 {
            let submitted = !sink.submitted.lock().unwrap().is_empty();
            if submitted && !schedule.lock().await.is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*sink.submitted.lock().unwrap(), vec![1]);
    }

    /// Sleeps before writing one sample, or panics.
    struct SlowCollector {
        delay: std::time::Duration,
        done: Arc<AtomicBool>,
        panic: bool,
    }

    #[async_trait]
    impl Collector for SlowCollector {
        fn id(&self) -> &str {
            "slow"
        }

        fn default_metrics(&self) -> Vec<MetricDefinition> {
            vec![]
        }

        async fn collect(
            &mut self,
            ctx: &CollectContext<'_>,
            buf: &mut MetricBuffer,
        ) -> std::result::Result<(), CollectError> {
            tokio::time::sleep(self.delay).await;
            if self.panic {
                panic!("collector blew up");
            }
            buf.write_sample("slow", MetricType::Float64, &MetricValue::Float(1.0), Some(ctx.window.end))
                .unwrap();
            self.done.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn wait_until_running(schedule: &Mutex<Schedule>) {
        for _ in 0..100 {
            if schedule.lock().await.is_running() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("collection never started");
    }

    #[tokio::test]
    async fn should_finish_in_flight_run_before_stopping() {
        let sink = Arc::new(RecordingSink::default());
        let done = Arc::new(AtomicBool::new(false));
        let collectors: Vec<Box<dyn Collector>> = vec![Box::new(SlowCollector {
            delay: std::time::Duration::from_millis(300),
            done: Arc::clone(&done),
            panic: false,
        })];
        let instance = CollectionInstance::new(pipeline(Arc::clone(&sink), collectors), 300);
        let schedule = Arc::clone(&instance.schedule);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(instance.start(cancel.clone()));

        wait_until_running(&schedule).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(done.load(Ordering::SeqCst));
        assert!(!schedule.lock().await.is_running());
        assert_eq!(*sink.submitted.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn should_release_schedule_after_run_panics() {
        let sink = Arc::new(RecordingSink::default());
        let collectors: Vec<Box<dyn Collector>> = vec![Box::new(SlowCollector {
            delay: std::time::Duration::from_millis(50),
            done: Arc::new(AtomicBool::new(false)),
            panic: true,
        })];
        let instance = CollectionInstance::new(pipeline(Arc::clone(&sink), collectors), 300);
        let schedule = Arc::clone(&instance.schedule);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(instance.start(cancel.clone()));

        wait_until_running(&schedule).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(!schedule.lock().await.is_running());
        assert!(sink.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn should_build_buffer_from_sink() {
        let sink = Arc::new(RecordingSink {
            trace: true,
            ..Default::default()
        });
        let collectors: Vec<Box<dyn Collector>> = vec![Box::new(StubCollector {
            id: "only".to_string(),
            samples: 1,
            fail: false,
        })];
        let window = TimeWindow {
            start: at(-600),
            end: at(0),
            granularity_secs: 60,
        };
        pipeline(Arc::clone(&sink), collectors)
            .collect_all(&window, &CancellationToken::new())
            .await;

        assert_eq!(*sink.traced.lock().unwrap(), vec![true]);
    }
}

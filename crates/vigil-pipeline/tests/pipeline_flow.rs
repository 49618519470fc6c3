//! End-to-end pipeline behavior: join protocol, pool bounding, degradation,
//! backpressure, flush, and shutdown hygiene.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use vigil_core::{
    BufferAudit, CropRect, FrameTransform, InferenceBackend, InputShape, MediaBuffer, ModelSession,
    ObjectRecord, PipelineError, Result, ResultTensor, TensorSample,
};
use vigil_pipeline::kinds::{StageLogic, StageRegistry};
use vigil_pipeline::synthetic::{SyntheticBackend, SyntheticTransform, fnv1a, synthetic_buffer};
use vigil_pipeline::{PipelineController, PipelineSettings};

// ─── Test collaborators ─────────────────────────────────────────────────────

/// Splits each incoming frame into a scripted number of objects.  Runs no
/// inference, so object-count scenarios are driven without touching the
/// backend from the first stage.
struct SeedLogic {
    counts: Mutex<VecDeque<usize>>,
    /// When set, one object per frame carries zero-width geometry.
    poison_one: bool,
}

impl SeedLogic {
    fn scripted(counts: &[usize], poison_one: bool) -> Arc<Self> {
        Arc::new(Self {
            counts: Mutex::new(counts.iter().copied().collect()),
            poison_one,
        })
    }
}

impl StageLogic for SeedLogic {
    fn kind(&self) -> &'static str {
        "seed"
    }

    fn uses_inference(&self) -> bool {
        false
    }

    fn process_direct(&self, _object: &ObjectRecord) -> Vec<ObjectRecord> {
        let count = self
            .counts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(1);
        (0..count)
            .map(|i| {
                let width = if self.poison_one && i == 0 { 0 } else { 8 };
                ObjectRecord::new(CropRect::new(
                    (i as u32 * 8) % 600,
                    (i as u32 * 8) % 400,
                    width,
                    8,
                ))
            })
            .collect()
    }
}

/// Inference kind that echoes its source object through.
struct EchoLogic;

impl StageLogic for EchoLogic {
    fn kind(&self) -> &'static str {
        "echo"
    }

    fn parse_result(&self, _tensor: &ResultTensor, source: &ObjectRecord) -> Result<Vec<ObjectRecord>> {
        Ok(vec![source.clone()])
    }
}

#[derive(Default)]
struct BackendCounters {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicU64,
}

/// Backend that tracks concurrent outstanding inferences and scrambles
/// completion order with content-derived latencies.
struct CountingBackend {
    counters: Arc<BackendCounters>,
    base_latency: Duration,
}

impl CountingBackend {
    fn new(base_latency: Duration) -> (Arc<Self>, Arc<BackendCounters>) {
        let counters = Arc::new(BackendCounters::default());
        (
            Arc::new(Self {
                counters: counters.clone(),
                base_latency,
            }),
            counters,
        )
    }
}

#[async_trait]
impl InferenceBackend for CountingBackend {
    async fn load_model(&self, _model: &Path, _device: &str) -> Result<Arc<dyn ModelSession>> {
        Ok(Arc::new(CountingSession {
            counters: self.counters.clone(),
            base_latency: self.base_latency,
        }))
    }
}

struct CountingSession {
    counters: Arc<BackendCounters>,
    base_latency: Duration,
}

#[async_trait]
impl ModelSession for CountingSession {
    fn input_shape(&self) -> InputShape {
        InputShape {
            width: 8,
            height: 8,
            channels: 3,
        }
    }

    async fn infer(&self, sample: TensorSample) -> Result<ResultTensor> {
        let current = self.counters.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(current, Ordering::SeqCst);
        self.counters.total.fetch_add(1, Ordering::SeqCst);

        // Content-derived jitter scrambles completion order.
        let jitter = Duration::from_micros(fnv1a(&sample.data) % 4_000);
        tokio::time::sleep(self.base_latency + jitter).await;

        self.counters.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ResultTensor::new(vec![1.0]))
    }
}

/// Transform that counts invocations before delegating.
struct CountingTransform {
    calls: AtomicU64,
}

impl CountingTransform {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU64::new(0),
        })
    }
}

impl FrameTransform for CountingTransform {
    fn transform(
        &self,
        buffer: &MediaBuffer,
        secondary: Option<&MediaBuffer>,
        crop: CropRect,
    ) -> Result<TensorSample> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        SyntheticTransform.transform(buffer, secondary, crop)
    }
}

fn seed_registry(counts: &'static [usize], poison_one: bool) -> StageRegistry {
    let mut registry = StageRegistry::new();
    registry.register("seed", move || SeedLogic::scripted(counts, poison_one));
    registry.register("echo", || Arc::new(EchoLogic));
    registry
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn frames_join_exactly_once_for_varied_object_counts() {
    const COUNTS: &[usize] = &[0, 1, 5, 50];
    let registry = seed_registry(COUNTS, false);
    let (backend, counters) = CountingBackend::new(Duration::from_micros(200));

    let mut settings = PipelineSettings::with_topology("seed ! echo");
    settings.queue_capacity = 4;
    let mut pipeline = PipelineController::create(
        settings,
        &registry,
        backend,
        Arc::new(SyntheticTransform),
    )
    .await
    .unwrap();
    pipeline.start().unwrap();

    let audit = BufferAudit::new();
    for seq in 0..COUNTS.len() as u64 {
        pipeline
            .submit(synthetic_buffer(&audit, 640, 480, seq), None)
            .await
            .unwrap();
    }
    pipeline.flush().await.unwrap();

    let mut arrived: Vec<(u64, usize)> = Vec::new();
    while let Some(frame) = pipeline.next_output().await {
        arrived.push((frame.frame_id, frame.objects.len()));
    }

    // The zero-object frame is released at the seed stage; every other
    // frame arrives exactly once with all its objects joined.
    arrived.sort_unstable();
    assert_eq!(arrived, vec![(1, 1), (2, 5), (3, 50)]);
    assert_eq!(counters.total.load(Ordering::SeqCst), 56);

    pipeline.stop().await.unwrap();
    assert_eq!(audit.live(), 0, "all buffers released after shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_inferences_never_exceed_pool_capacity() {
    const COUNTS: &[usize] = &[24, 24, 24];
    let registry = seed_registry(COUNTS, false);
    let (backend, counters) = CountingBackend::new(Duration::from_millis(1));

    let mut settings = PipelineSettings::with_topology("seed ! echo");
    settings.pool_capacity = 4;
    let mut pipeline = PipelineController::create(
        settings,
        &registry,
        backend,
        Arc::new(SyntheticTransform),
    )
    .await
    .unwrap();
    pipeline.start().unwrap();

    let audit = BufferAudit::new();
    for seq in 0..3 {
        pipeline
            .submit(synthetic_buffer(&audit, 640, 480, seq), None)
            .await
            .unwrap();
    }
    pipeline.flush().await.unwrap();

    let mut frames = 0;
    while let Some(frame) = pipeline.next_output().await {
        assert_eq!(frame.objects.len(), 24);
        frames += 1;
    }
    assert_eq!(frames, 3);
    assert_eq!(counters.total.load(Ordering::SeqCst), 72);
    assert!(
        counters.peak.load(Ordering::SeqCst) <= 4,
        "peak {} exceeded pool capacity",
        counters.peak.load(Ordering::SeqCst)
    );

    pipeline.stop().await.unwrap();
    assert_eq!(audit.live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_object_frame_passes_without_backend_calls() {
    const COUNTS: &[usize] = &[0];
    let registry = seed_registry(COUNTS, false);
    let (backend, counters) = CountingBackend::new(Duration::ZERO);

    let settings = PipelineSettings::with_topology("seed ! echo");
    let mut pipeline = PipelineController::create(
        settings,
        &registry,
        backend,
        Arc::new(SyntheticTransform),
    )
    .await
    .unwrap();
    pipeline.start().unwrap();

    let audit = BufferAudit::new();
    pipeline
        .submit(synthetic_buffer(&audit, 640, 480, 0), None)
        .await
        .unwrap();
    pipeline.flush().await.unwrap();

    assert!(pipeline.next_output().await.is_none());
    assert_eq!(counters.total.load(Ordering::SeqCst), 0);

    pipeline.stop().await.unwrap();
    assert_eq!(audit.live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_geometry_degrades_object_not_frame() {
    const COUNTS: &[usize] = &[3];
    let registry = seed_registry(COUNTS, true);
    let (backend, counters) = CountingBackend::new(Duration::ZERO);
    let transform = CountingTransform::new();

    let settings = PipelineSettings::with_topology("seed ! echo");
    let mut pipeline =
        PipelineController::create(settings, &registry, backend, transform.clone())
            .await
            .unwrap();
    pipeline.start().unwrap();

    let audit = BufferAudit::new();
    pipeline
        .submit(synthetic_buffer(&audit, 640, 480, 0), None)
        .await
        .unwrap();
    pipeline.flush().await.unwrap();

    let frame = pipeline.next_output().await.expect("frame must survive");
    assert_eq!(frame.objects.len(), 2, "two healthy objects remain");
    assert!(pipeline.next_output().await.is_none());

    // The zero-width object skipped transform and inference entirely.
    assert_eq!(transform.calls.load(Ordering::SeqCst), 2);
    assert_eq!(counters.total.load(Ordering::SeqCst), 2);

    let metrics = pipeline.stage_metrics();
    let echo = metrics
        .iter()
        .find(|(name, _)| name == "echo")
        .map(|(_, m)| m)
        .unwrap();
    assert_eq!(echo.objects_degraded, 1);

    drop(frame);
    pipeline.stop().await.unwrap();
    assert_eq!(audit.live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn repeated_start_stop_cycles_leak_nothing() {
    let audit = BufferAudit::new();

    for cycle in 0..3u64 {
        const COUNTS: &[usize] = &[6, 6, 6, 6, 6, 6, 6, 6];
        let registry = seed_registry(COUNTS, false);
        let (backend, _) = CountingBackend::new(Duration::from_millis(5));

        let mut settings = PipelineSettings::with_topology("seed ! echo");
        settings.queue_capacity = 2;
        let mut pipeline = PipelineController::create(
            settings,
            &registry,
            backend,
            Arc::new(SyntheticTransform),
        )
        .await
        .unwrap();
        pipeline.start().unwrap();

        for seq in 0..8 {
            // Backpressure may reject some; both outcomes are fine here.
            let _ = pipeline.try_submit(synthetic_buffer(&audit, 640, 480, cycle * 100 + seq), None);
        }
        // Stop with frames queued and inferences in flight.
        pipeline.stop().await.unwrap();

        for (name, metrics) in pipeline.stage_metrics() {
            assert_eq!(
                metrics.inferences_in_flight, 0,
                "stage {name} still reports in-flight work after stop"
            );
        }
        // Output frames nobody retrieved were released by the teardown.
        assert_eq!(audit.live(), 0, "cycle {cycle} leaked buffers");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_input_queue_rejects_try_submit() {
    const COUNTS: &[usize] = &[1, 1, 1, 1, 1, 1, 1, 1];
    let registry = seed_registry(COUNTS, false);
    // One slot and a long inference keep the echo worker pinned.
    let (backend, _) = CountingBackend::new(Duration::from_millis(500));

    let mut settings = PipelineSettings::with_topology("seed ! echo");
    settings.queue_capacity = 1;
    settings.pool_capacity = 1;
    let mut pipeline = PipelineController::create(
        settings,
        &registry,
        backend,
        Arc::new(SyntheticTransform),
    )
    .await
    .unwrap();
    pipeline.start().unwrap();

    let audit = BufferAudit::new();
    let mut rejected = false;
    for seq in 0..8 {
        match pipeline.try_submit(synthetic_buffer(&audit, 640, 480, seq), None) {
            Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(PipelineError::QueueFull) => {
                rejected = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(rejected, "bounded queue must push back, not drop");

    pipeline.stop().await.unwrap();
    assert_eq!(audit.live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn flush_wakes_a_blocked_consumer() {
    const COUNTS: &[usize] = &[1];
    let registry = seed_registry(COUNTS, false);
    let (backend, _) = CountingBackend::new(Duration::ZERO);

    let settings = PipelineSettings::with_topology("seed ! echo");
    let mut pipeline = Arc::new(
        PipelineController::create(settings, &registry, backend, Arc::new(SyntheticTransform))
            .await
            .unwrap(),
    );
    Arc::get_mut(&mut pipeline).unwrap().start().unwrap();

    let consumer = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            // Drains the single frame, then blocks until the sentinel.
            let mut frames = 0;
            while pipeline.next_output().await.is_some() {
                frames += 1;
            }
            frames
        })
    };

    let audit = BufferAudit::new();
    pipeline
        .submit(synthetic_buffer(&audit, 640, 480, 0), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    pipeline.flush().await.unwrap();

    let frames = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .expect("flush must unblock the consumer")
        .unwrap();
    assert_eq!(frames, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn builtin_chain_processes_synthetic_frames() {
    let registry = StageRegistry::with_builtins();
    let settings = PipelineSettings::with_topology("detect ! track ! classify");
    let mut pipeline = PipelineController::create(
        settings,
        &registry,
        Arc::new(SyntheticBackend::new()),
        Arc::new(SyntheticTransform),
    )
    .await
    .unwrap();
    pipeline.start().unwrap();

    let audit = BufferAudit::new();
    for seq in 0..10 {
        pipeline
            .submit(synthetic_buffer(&audit, 640, 480, seq), None)
            .await
            .unwrap();
    }
    pipeline.flush().await.unwrap();

    let mut frames = 0;
    while let Some(frame) = pipeline.next_output().await {
        frames += 1;
        assert!(!frame.objects.is_empty());
        for object in &frame.objects {
            assert!(!object.label.is_empty(), "classify must label objects");
            assert!(object.identity.is_some(), "track must assign identities");
        }
    }
    assert_eq!(frames, 10, "every synthetic frame carries detections");

    pipeline.stop().await.unwrap();
    assert_eq!(audit.live(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn branched_topology_fans_out_and_joins_at_sink() {
    let registry = StageRegistry::with_builtins();
    let settings = PipelineSettings::with_topology("detect ! track name=t ! t.classify ! t.reid");
    let mut pipeline = PipelineController::create(
        settings,
        &registry,
        Arc::new(SyntheticBackend::new()),
        Arc::new(SyntheticTransform),
    )
    .await
    .unwrap();
    assert_eq!(pipeline.descriptors().len(), 4);
    pipeline.start().unwrap();

    let audit = BufferAudit::new();
    for seq in 0..4 {
        pipeline
            .submit(synthetic_buffer(&audit, 640, 480, seq), None)
            .await
            .unwrap();
    }
    pipeline.flush().await.unwrap();

    // The classify branch forwards every frame; the reid branch filters
    // young identities, so between 4 and 8 frames reach the sink.
    let mut frames = 0;
    while pipeline.next_output().await.is_some() {
        frames += 1;
    }
    assert!((4..=8).contains(&frames), "got {frames} sink frames");

    pipeline.stop().await.unwrap();
    assert_eq!(audit.live(), 0);
}

#[tokio::test]
async fn unknown_stage_kind_fails_creation() {
    let registry = StageRegistry::with_builtins();
    let settings = PipelineSettings::with_topology("detect ! segment");
    let err = PipelineController::create(
        settings,
        &registry,
        Arc::new(SyntheticBackend::new()),
        Arc::new(SyntheticTransform),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownStageKind(kind) if kind == "segment"));
}

#[tokio::test]
async fn unsupported_device_fails_creation() {
    let registry = StageRegistry::with_builtins();
    let mut settings = PipelineSettings::with_topology("detect");
    settings.stages.insert(
        "detect".into(),
        vigil_pipeline::StageSettings {
            model: None,
            device: Some("npu9000".into()),
        },
    );
    let err = PipelineController::create(
        settings,
        &registry,
        Arc::new(SyntheticBackend::new()),
        Arc::new(SyntheticTransform),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PipelineError::UnsupportedDevice(_)));
}

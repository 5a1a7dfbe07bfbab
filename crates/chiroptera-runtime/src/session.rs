//! [`SonarSession`] – the ranging session controller.
//!
//! Producers (audio capture, IMU, depth sensors) never talk to the
//! estimators directly. They offer samples through a cloneable
//! [`SessionHandle`] into bounded queues; a full queue drops the sample and
//! counts it instead of blocking the producer.
//!
//! One processing task owns every piece of mutable estimation state:
//!
//! | State | Fed by |
//! |---|---|
//! | [`OrientationFilter`] | IMU samples, in timestamp order |
//! | [`PositionFilter`] | IMU samples, rotated by the current orientation |
//! | [`MultiSensorDistanceFuser`] | depth readings and correlated sonar pings, coalesced per fusion tick |
//! | [`RoomGeometryReconstructor`] | fused readings while a sweep is active |
//!
//! Echo correlation and room reconstruction run on the blocking pool and
//! report back through [`JoinSet`]s, so IMU processing keeps flowing while
//! they work. Snapshots (orientation, position, scan phase, latest room
//! model) are published through `watch` channels; the fused stream and
//! faults go out on the [`EventBus`].
//!
//! # Example
//!
//! ```rust,no_run
//! use chiroptera_middleware::EventBus;
//! use chiroptera_runtime::session::{SessionConfig, SonarSession};
//! use chiroptera_types::ControlSignal;
//!
//! # async fn demo() -> Result<(), chiroptera_types::ChiropteraError> {
//! let session = SonarSession::spawn(SessionConfig::default(), EventBus::default())?;
//! let handle = session.handle();
//! handle.send_control(ControlSignal::StartSweep).await?;
//! // ... push IMU samples and depth readings through `handle` ...
//! handle.send_control(ControlSignal::SweepComplete).await?;
//! session.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chiroptera_middleware::EventBus;
use chiroptera_perception::fusion::{FusionConfig, MultiSensorDistanceFuser};
use chiroptera_perception::orientation::{OrientationConfig, OrientationFilter};
use chiroptera_perception::position::{PositionConfig, PositionFilter};
use chiroptera_perception::room::{ReconstructionConfig, RoomGeometryReconstructor};
use chiroptera_sonar::chirp::ChirpGenerator;
use chiroptera_sonar::correlator::{CorrelatorConfig, EchoCorrelator};
use chiroptera_types::{
    AudioBuffer, ChiropteraError, ChirpWaveform, ControlSignal, DistanceMeasurement,
    EchoDetectionResult, Event, EventPayload, ImuSample, OrientationState, PingCapture,
    PositionState, RoomModel, ScanPhase,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SOURCE: &str = "chiroptera-runtime::session";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub waveform: ChirpWaveform,
    pub correlator: CorrelatorConfig,
    pub orientation: OrientationConfig,
    pub position: PositionConfig,
    pub fusion: FusionConfig,
    pub reconstruction: ReconstructionConfig,
    pub audio_queue_capacity: usize,
    pub imu_queue_capacity: usize,
    pub depth_queue_capacity: usize,
    pub control_queue_capacity: usize,
    /// Period at which buffered readings are coalesced and fused.
    pub fusion_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            waveform: ChirpWaveform::default(),
            correlator: CorrelatorConfig::default(),
            orientation: OrientationConfig::default(),
            position: PositionConfig::default(),
            fusion: FusionConfig::default(),
            reconstruction: ReconstructionConfig::default(),
            audio_queue_capacity: 8,
            imu_queue_capacity: 512,
            depth_queue_capacity: 512,
            control_queue_capacity: 16,
            fusion_interval_ms: 20,
        }
    }
}

impl SessionConfig {
    fn validate(&self) -> Result<(), ChiropteraError> {
        let queues = [
            ("audio", self.audio_queue_capacity),
            ("imu", self.imu_queue_capacity),
            ("depth", self.depth_queue_capacity),
            ("control", self.control_queue_capacity),
        ];
        if let Some((name, _)) = queues.iter().find(|(_, cap)| *cap == 0) {
            return Err(ChiropteraError::Config(format!("{name} queue capacity must be positive")));
        }
        if self.fusion_interval_ms == 0 {
            return Err(ChiropteraError::Config("fusion interval must be positive".into()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Counters
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Counters {
    dropped_audio: AtomicU64,
    dropped_imu: AtomicU64,
    dropped_depth: AtomicU64,
    stale_imu: AtomicU64,
    discarded_pings: AtomicU64,
    fused: AtomicU64,
}

/// Point-in-time copy of the session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Captures refused because the audio queue was full.
    pub dropped_audio: u64,
    pub dropped_imu: u64,
    pub dropped_depth: u64,
    /// IMU samples older than the filter state.
    pub stale_imu: u64,
    /// Captures received while not pinging, or correlated after a `StopPing`.
    pub discarded_pings: u64,
    pub fused: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable producer/consumer side of a running session.
#[derive(Clone)]
pub struct SessionHandle {
    audio_tx: mpsc::Sender<PingCapture>,
    imu_tx: mpsc::Sender<ImuSample>,
    depth_tx: mpsc::Sender<DistanceMeasurement>,
    control_tx: mpsc::Sender<ControlSignal>,
    counters: Arc<Counters>,
    orientation: watch::Receiver<OrientationState>,
    position: watch::Receiver<PositionState>,
    phase: watch::Receiver<ScanPhase>,
    room: watch::Receiver<Option<RoomModel>>,
    chirp: Arc<AudioBuffer>,
}

impl SessionHandle {
    /// Offer a recording. Returns `false` when it was dropped.
    pub fn push_capture(&self, capture: PingCapture) -> bool {
        offer(&self.audio_tx, capture, &self.counters.dropped_audio, "audio")
    }

    pub fn push_imu(&self, sample: ImuSample) -> bool {
        offer(&self.imu_tx, sample, &self.counters.dropped_imu, "imu")
    }

    pub fn push_depth(&self, reading: DistanceMeasurement) -> bool {
        offer(&self.depth_tx, reading, &self.counters.dropped_depth, "depth")
    }

    /// Deliver a control signal. Unlike samples, control signals wait for
    /// queue space rather than being dropped.
    pub async fn send_control(&self, signal: ControlSignal) -> Result<(), ChiropteraError> {
        self.control_tx
            .send(signal)
            .await
            .map_err(|_| ChiropteraError::Channel("session has shut down".into()))
    }

    /// The session's chirp, stamped with `emitted_at`, ready to be played.
    pub fn chirp_at(&self, emitted_at: DateTime<Utc>) -> AudioBuffer {
        AudioBuffer {
            samples: self.chirp.samples.clone(),
            sample_rate_hz: self.chirp.sample_rate_hz,
            start_timestamp: emitted_at,
        }
    }

    pub fn orientation(&self) -> OrientationState {
        *self.orientation.borrow()
    }

    pub fn position(&self) -> PositionState {
        *self.position.borrow()
    }

    pub fn phase(&self) -> ScanPhase {
        *self.phase.borrow()
    }

    /// The most recently finalised room, if any.
    pub fn room_model(&self) -> Option<RoomModel> {
        self.room.borrow().clone()
    }

    pub fn watch_phase(&self) -> watch::Receiver<ScanPhase> {
        self.phase.clone()
    }

    pub fn watch_room(&self) -> watch::Receiver<Option<RoomModel>> {
        self.room.clone()
    }

    pub fn stats(&self) -> SessionStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        SessionStats {
            dropped_audio: load(&c.dropped_audio),
            dropped_imu: load(&c.dropped_imu),
            dropped_depth: load(&c.dropped_depth),
            stale_imu: load(&c.stale_imu),
            discarded_pings: load(&c.discarded_pings),
            fused: load(&c.fused),
        }
    }
}

fn offer<T>(tx: &mpsc::Sender<T>, item: T, dropped: &AtomicU64, queue: &'static str) -> bool {
    match tx.try_send(item) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            bump(dropped);
            debug!(queue, "queue full, sample dropped");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(queue, "session closed, sample dropped");
            false
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SonarSession
// ─────────────────────────────────────────────────────────────────────────────

/// A running session: its handle plus the processing task.
pub struct SonarSession {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

impl SonarSession {
    /// Validate `config`, render the chirp and start the processing task.
    /// Must be called from inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`ChiropteraError::InvalidWaveformConfig`] when the chirp cannot be
    ///   rendered.
    /// - [`ChiropteraError::Config`] for a zero queue capacity or fusion
    ///   interval.
    pub fn spawn(config: SessionConfig, bus: EventBus) -> Result<Self, ChiropteraError> {
        config.validate()?;
        let now = Utc::now();
        let chirp = Arc::new(ChirpGenerator::new().generate(&config.waveform, now)?);

        let (audio_tx, audio_rx) = mpsc::channel(config.audio_queue_capacity);
        let (imu_tx, imu_rx) = mpsc::channel(config.imu_queue_capacity);
        let (depth_tx, depth_rx) = mpsc::channel(config.depth_queue_capacity);
        let (control_tx, control_rx) = mpsc::channel(config.control_queue_capacity);

        let orientation = OrientationFilter::new(config.orientation, now);
        let position = PositionFilter::new(config.position, now);
        let (orientation_tx, orientation_rx) = watch::channel(orientation.current_state());
        let (position_tx, position_rx) = watch::channel(position.current_state());
        let (phase_tx, phase_rx) = watch::channel(ScanPhase::Idle);
        let (room_tx, room_rx) = watch::channel(None);

        let counters = Arc::new(Counters::default());
        let processor = Processor {
            config,
            bus,
            counters: Arc::clone(&counters),
            correlator: Arc::new(EchoCorrelator::new(config.correlator)),
            chirp: Arc::clone(&chirp),
            orientation,
            position,
            fuser: MultiSensorDistanceFuser::new(config.fusion),
            reconstructor: RoomGeometryReconstructor::new(config.reconstruction),
            pending: Vec::new(),
            pinging: false,
            ping_generation: 0,
            scan_generation: 0,
            phase: ScanPhase::Idle,
            scan_id: None,
            pose_dirty: false,
            degraded_reported: false,
            orientation_tx,
            position_tx,
            phase_tx,
            room_tx,
        };
        let inputs = Inputs {
            audio_rx,
            imu_rx,
            depth_rx,
            control_rx,
        };
        let task = tokio::spawn(processor.run(inputs));

        Ok(Self {
            handle: SessionHandle {
                audio_tx,
                imu_tx,
                depth_tx,
                control_tx,
                counters,
                orientation: orientation_rx,
                position: position_rx,
                phase: phase_rx,
                room: room_rx,
                chirp,
            },
            task,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Send `Shutdown` and wait for the processing task to finish.
    pub async fn shutdown(self) -> Result<(), ChiropteraError> {
        // Already stopped is fine.
        let _ = self.handle.control_tx.send(ControlSignal::Shutdown).await;
        self.task
            .await
            .map_err(|e| ChiropteraError::Channel(format!("processing task failed: {e}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Processing task
// ─────────────────────────────────────────────────────────────────────────────

type Correlation = (u64, Result<(EchoDetectionResult, DistanceMeasurement), ChiropteraError>);
type Reconstruction = (u64, RoomGeometryReconstructor, Result<RoomModel, ChiropteraError>);

struct Inputs {
    audio_rx: mpsc::Receiver<PingCapture>,
    imu_rx: mpsc::Receiver<ImuSample>,
    depth_rx: mpsc::Receiver<DistanceMeasurement>,
    control_rx: mpsc::Receiver<ControlSignal>,
}

enum Flow {
    Continue,
    Stop,
}

struct Processor {
    config: SessionConfig,
    bus: EventBus,
    counters: Arc<Counters>,
    correlator: Arc<EchoCorrelator>,
    chirp: Arc<AudioBuffer>,
    orientation: OrientationFilter,
    position: PositionFilter,
    fuser: MultiSensorDistanceFuser,
    reconstructor: RoomGeometryReconstructor,
    /// Readings waiting for the next fusion tick.
    pending: Vec<DistanceMeasurement>,
    pinging: bool,
    ping_generation: u64,
    scan_generation: u64,
    phase: ScanPhase,
    scan_id: Option<Uuid>,
    pose_dirty: bool,
    degraded_reported: bool,
    orientation_tx: watch::Sender<OrientationState>,
    position_tx: watch::Sender<PositionState>,
    phase_tx: watch::Sender<ScanPhase>,
    room_tx: watch::Sender<Option<RoomModel>>,
}

impl Processor {
    async fn run(mut self, mut inputs: Inputs) {
        let mut correlations: JoinSet<Correlation> = JoinSet::new();
        let mut reconstructions: JoinSet<Reconstruction> = JoinSet::new();
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.fusion_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("session processing task started");

        loop {
            tokio::select! {
                biased;
                signal = inputs.control_rx.recv() => {
                    let Some(signal) = signal else { break };
                    if let Flow::Stop = self.handle_control(signal, &mut reconstructions) {
                        break;
                    }
                }
                Some(joined) = correlations.join_next() => self.finish_correlation(joined),
                Some(joined) = reconstructions.join_next() => self.finish_reconstruction(joined),
                // Ahead of the sample queues so a busy producer cannot hold fusion back.
                _ = tick.tick() => self.fusion_tick(),
                Some(sample) = inputs.imu_rx.recv() => self.apply_imu(&sample),
                Some(reading) = inputs.depth_rx.recv() => self.pending.push(reading),
                Some(capture) = inputs.audio_rx.recv() => self.start_correlation(capture, &mut correlations),
            }
        }

        info!(
            in_flight_pings = correlations.len(),
            pending = self.pending.len(),
            "session processing task stopped"
        );
    }

    fn handle_control(&mut self, signal: ControlSignal, reconstructions: &mut JoinSet<Reconstruction>) -> Flow {
        debug!(?signal, "control signal");
        match signal {
            ControlSignal::StartPing => {
                self.pinging = true;
                info!("pinging started");
            }
            ControlSignal::StopPing => {
                self.pinging = false;
                self.ping_generation += 1;
                info!(generation = self.ping_generation, "pinging stopped");
            }
            ControlSignal::StartSweep => self.start_sweep(),
            ControlSignal::SweepComplete => self.complete_sweep(reconstructions),
            ControlSignal::StopSweep => self.stop_sweep(),
            ControlSignal::Shutdown => return Flow::Stop,
        }
        Flow::Continue
    }

    // ── Sonar ───────────────────────────────────────────────────────────────

    fn start_correlation(&mut self, capture: PingCapture, correlations: &mut JoinSet<Correlation>) {
        if !self.pinging {
            bump(&self.counters.discarded_pings);
            debug!("capture received while not pinging, discarded");
            return;
        }
        let generation = self.ping_generation;
        let correlator = Arc::clone(&self.correlator);
        let mut transmitted = (*self.chirp).clone();
        transmitted.start_timestamp = capture.recorded.start_timestamp;
        correlations.spawn_blocking(move || {
            let outcome = correlator.range(&capture.recorded, &transmitted, capture.direction);
            (generation, outcome)
        });
    }

    fn finish_correlation(&mut self, joined: Result<Correlation, JoinError>) {
        let (generation, outcome) = match joined {
            Ok(done) => done,
            Err(e) => {
                warn!(error = %e, "correlation task failed");
                self.alert("correlator", e.to_string());
                return;
            }
        };
        if generation != self.ping_generation {
            bump(&self.counters.discarded_pings);
            debug!(generation, current = self.ping_generation, "stale ping result discarded");
            return;
        }
        match outcome {
            Ok((result, reading)) => {
                debug!(
                    delay = result.delay_seconds,
                    confidence = result.confidence,
                    status = ?result.status,
                    "echo correlated"
                );
                self.publish(EventPayload::Echo {
                    result,
                    distance_meters: reading.distance_meters,
                });
                if reading.has_distance() {
                    self.pending.push(reading);
                }
            }
            Err(err) => {
                warn!(error = %err, retryable = err.is_retryable(), "ping failed");
                self.alert("correlator", err.to_string());
            }
        }
    }

    // ── Inertial ────────────────────────────────────────────────────────────

    fn apply_imu(&mut self, sample: &ImuSample) {
        let was_initialized = self.orientation.is_initialized();
        if !self.orientation.apply_imu(sample) {
            bump(&self.counters.stale_imu);
            return;
        }
        if was_initialized {
            let q = self.orientation.current_state().orientation;
            if !self.position.predict_at(sample.timestamp, sample.accelerometer, q) {
                bump(&self.counters.stale_imu);
            }
        } else {
            self.position = PositionFilter::new(self.config.position, sample.timestamp);
            info!("orientation initialised from first IMU sample");
        }

        self.orientation_tx.send_replace(self.orientation.current_state());
        self.position_tx.send_replace(self.position.current_state());
        self.pose_dirty = true;

        if self.position.is_degraded() && !self.degraded_reported {
            self.degraded_reported = true;
            let std = self.position.current_state().position_std_meters();
            warn!(position_std = std, "dead-reckoned position degraded");
            self.alert("position", format!("position uncertainty {std:.3} m exceeds ceiling"));
        }
    }

    // ── Fusion ──────────────────────────────────────────────────────────────

    fn fusion_tick(&mut self) {
        if self.pose_dirty {
            self.pose_dirty = false;
            self.publish(EventPayload::Orientation(self.orientation.current_state()));
            self.publish(EventPayload::Position(self.position.current_state()));
        }
        self.fuse_pending();
    }

    fn fuse_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let readings = std::mem::take(&mut self.pending);
        let pose = self
            .orientation
            .is_initialized()
            .then(|| self.orientation.current_state().orientation);

        for group in self.fuser.coalesce(&readings) {
            let fused = self.fuser.fuse(&group, pose);
            bump(&self.counters.fused);
            if self.phase == ScanPhase::Sweeping
                && let Err(err) = self.reconstructor.add_measurement(&fused)
            {
                warn!(error = %err, "reading not accumulated");
            }
            self.publish(EventPayload::FusedDistance(fused));
        }
    }

    // ── Scans ───────────────────────────────────────────────────────────────

    fn start_sweep(&mut self) {
        match self.phase {
            ScanPhase::Idle => {}
            ScanPhase::Finalized => {
                // The finalised model stays in the room snapshot.
                self.reconstructor = RoomGeometryReconstructor::new(self.config.reconstruction);
            }
            found => {
                self.reject(ChiropteraError::InvalidScanState {
                    expected: ScanPhase::Idle,
                    found,
                });
                return;
            }
        }
        match self.reconstructor.start_sweep() {
            Ok(id) => {
                self.scan_id = Some(id);
                self.set_phase(ScanPhase::Sweeping);
            }
            Err(err) => self.reject(err),
        }
    }

    fn complete_sweep(&mut self, reconstructions: &mut JoinSet<Reconstruction>) {
        if self.phase != ScanPhase::Sweeping {
            self.reject(ChiropteraError::InvalidScanState {
                expected: ScanPhase::Sweeping,
                found: self.phase,
            });
            return;
        }
        self.fuse_pending();

        let mut reconstructor = std::mem::replace(
            &mut self.reconstructor,
            RoomGeometryReconstructor::new(self.config.reconstruction),
        );
        let generation = self.scan_generation;
        self.set_phase(ScanPhase::Reconstructing);
        reconstructions.spawn_blocking(move || {
            let outcome = reconstructor.complete_sweep();
            (generation, reconstructor, outcome)
        });
    }

    fn finish_reconstruction(&mut self, joined: Result<Reconstruction, JoinError>) {
        let (generation, reconstructor, outcome) = match joined {
            Ok(done) => done,
            Err(e) => {
                warn!(error = %e, "reconstruction task failed");
                self.alert("reconstructor", e.to_string());
                if self.phase == ScanPhase::Reconstructing {
                    self.set_phase(ScanPhase::Idle);
                }
                return;
            }
        };
        if generation != self.scan_generation {
            debug!(generation, "reconstruction of a stopped sweep discarded");
            return;
        }
        self.reconstructor = reconstructor;
        match outcome {
            Ok(model) => {
                info!(
                    scan_id = %model.scan_id,
                    length = model.length,
                    width = model.width,
                    height = model.height,
                    walls = model.walls.len(),
                    "room finalised"
                );
                self.room_tx.send_replace(Some(model.clone()));
                self.set_phase(ScanPhase::Finalized);
                self.publish(EventPayload::RoomFinalized(model));
            }
            Err(err) => {
                warn!(error = %err, "room reconstruction rejected, resweep required");
                self.alert("reconstructor", err.to_string());
                self.set_phase(ScanPhase::Idle);
            }
        }
    }

    fn stop_sweep(&mut self) {
        match self.phase {
            ScanPhase::Sweeping => {
                self.reconstructor.abort();
                self.set_phase(ScanPhase::Idle);
            }
            ScanPhase::Reconstructing => {
                self.scan_generation += 1;
                self.set_phase(ScanPhase::Idle);
            }
            ScanPhase::Idle | ScanPhase::Finalized => debug!("no sweep in progress"),
        }
    }

    fn set_phase(&mut self, phase: ScanPhase) {
        self.phase = phase;
        self.phase_tx.send_replace(phase);
        info!(scan_id = ?self.scan_id, ?phase, "scan phase changed");
        self.publish(EventPayload::ScanPhaseChanged {
            scan_id: self.scan_id,
            phase,
        });
        if phase == ScanPhase::Idle {
            self.scan_id = None;
        }
    }

    // ── Bus ─────────────────────────────────────────────────────────────────

    fn reject(&self, err: ChiropteraError) {
        warn!(error = %err, "control signal rejected");
        self.alert("session", err.to_string());
    }

    fn alert(&self, component: &str, message: String) {
        self.publish(EventPayload::Fault {
            component: component.to_string(),
            message,
        });
    }

    fn publish(&self, payload: EventPayload) {
        if let Err(e) = self.bus.publish(Event::new(SOURCE, payload)) {
            warn!(error = %e, "event bus publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chiroptera_hal::sim::{RangeNoise, SimRegistry, SimRoom};
    use chiroptera_middleware::Topic;
    use chiroptera_types::{SensorType, Vec3, offset_by_seconds};

    async fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        tokio::time::timeout(Duration::from_secs(20), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn fusion_ticks_while_imu_backlog_drains() -> Result<(), Box<dyn std::error::Error>> {
        const SAMPLES: usize = 100_000;
        let config = SessionConfig {
            imu_queue_capacity: SAMPLES,
            fusion_interval_ms: 5,
            ..SessionConfig::default()
        };
        let bus = EventBus::default();
        let mut pose = bus.subscribe_to(Topic::Pose);
        let session = SonarSession::spawn(config, bus)?;
        let handle = session.handle();

        let t0 = Utc::now();
        let last = offset_by_seconds(t0, (SAMPLES - 1) as f64 * 0.001);
        for k in 0..SAMPLES {
            let sample = ImuSample {
                timestamp: offset_by_seconds(t0, k as f64 * 0.001),
                accelerometer: Vec3::new(0.0, 0.0, 9.80665),
                gyroscope: Vec3::zero(),
                magnetometer: None,
            };
            assert!(handle.push_imu(sample));
        }

        let first = tokio::time::timeout(Duration::from_secs(20), async {
            while let Some(event) = pose.next().await {
                if let EventPayload::Orientation(state) = event.payload {
                    return Some(state);
                }
            }
            None
        })
        .await?
        .ok_or("bus closed")?;
        assert!(first.timestamp < last, "pose was only published after the whole backlog");

        session.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn invalid_configs_are_rejected() {
        let mut bad_chirp = SessionConfig::default();
        bad_chirp.waveform.end_frequency_hz = bad_chirp.waveform.start_frequency_hz;
        assert!(matches!(
            SonarSession::spawn(bad_chirp, EventBus::default()),
            Err(ChiropteraError::InvalidWaveformConfig(_))
        ));

        let mut bad_queue = SessionConfig::default();
        bad_queue.imu_queue_capacity = 0;
        assert!(matches!(
            SonarSession::spawn(bad_queue, EventBus::default()),
            Err(ChiropteraError::Config(_))
        ));
    }

    #[tokio::test]
    async fn ping_produces_fused_sonar_distance() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut ranging = bus.subscribe_to(Topic::Ranging);
        let session = SonarSession::spawn(SessionConfig::default(), bus)?;
        let handle = session.handle();

        let mut registry = SimRegistry::builder()
            .with_room(SimRoom::from_dimensions(6.0, 8.0, 2.5, 1.2))
            .with_echo_device("mic", 44_100)
            .with_seed(11)
            .build();
        let direction = Vec3::new(1.0, 0.0, 0.0);
        let chirp = handle.chirp_at(Utc::now());
        let recorded = registry.echo_device("mic")?.ping(&chirp, direction, 0.05)?;

        handle.send_control(ControlSignal::StartPing).await?;
        assert!(handle.push_capture(PingCapture { recorded, direction }));

        let fused = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ranging.next().await {
                    Some(Event {
                        payload: EventPayload::FusedDistance(m),
                        ..
                    }) => return Some(m),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await?
        .ok_or("bus closed")?;

        assert_eq!(fused.sensor_type, SensorType::Fused);
        let d = fused.distance_meters.ok_or("no distance")?;
        assert!((d - 3.0).abs() < 0.01, "fused distance {d}");
        assert!(fused.confidence > 0.0);

        session.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn captures_outside_pinging_are_discarded() -> Result<(), Box<dyn std::error::Error>> {
        let session = SonarSession::spawn(SessionConfig::default(), EventBus::default())?;
        let handle = session.handle();
        let recorded = AudioBuffer {
            samples: vec![0.0; 2048],
            sample_rate_hz: 44_100,
            start_timestamp: Utc::now(),
        };

        handle.send_control(ControlSignal::StartPing).await?;
        handle.send_control(ControlSignal::StopPing).await?;
        assert!(handle.push_capture(PingCapture {
            recorded,
            direction: Vec3::new(1.0, 0.0, 0.0),
        }));

        assert!(wait_for(|| handle.stats().discarded_pings == 1).await);
        assert_eq!(handle.stats().fused, 0);
        session.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() -> Result<(), Box<dyn std::error::Error>> {
        let config = SessionConfig {
            depth_queue_capacity: 2,
            ..SessionConfig::default()
        };
        let session = SonarSession::spawn(config, EventBus::default())?;
        let handle = session.handle();
        let now = Utc::now();
        let reading = DistanceMeasurement::new(Some(1.0), SensorType::Lidar, 0.9, Vec3::new(1.0, 0.0, 0.0), now);

        // The processing task has not run yet, so nothing drains the queue.
        let accepted = (0..5).filter(|_| handle.push_depth(reading)).count();
        assert_eq!(accepted, 2);
        assert_eq!(handle.stats().dropped_depth, 3);
        session.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn imu_stream_updates_orientation_snapshot() -> Result<(), Box<dyn std::error::Error>> {
        let session = SonarSession::spawn(SessionConfig::default(), EventBus::default())?;
        let handle = session.handle();

        let sim = SimRegistry::builder().with_imu("imu0").with_seed(5);
        let scene = sim.scene();
        scene.set_orientation(chiroptera_types::Quaternion::from_euler(0.3, -0.1, 0.0));
        let mut registry = sim.build();

        let t0 = Utc::now();
        for k in 0..30 {
            let sample = registry.read_imu("imu0", offset_by_seconds(t0, k as f64 * 0.01))?;
            assert!(handle.push_imu(sample));
        }
        // Older than everything above.
        let stale = registry.read_imu("imu0", offset_by_seconds(t0, -1.0))?;
        assert!(handle.push_imu(stale));

        assert!(wait_for(|| handle.stats().stale_imu == 1).await);
        let (roll, pitch, _) = handle.orientation().euler();
        assert!((roll - 0.3).abs() < 0.05, "roll {roll}");
        assert!((pitch + 0.1).abs() < 0.05, "pitch {pitch}");
        session.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn empty_sweep_returns_to_idle_with_fault() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::Alerts);
        let session = SonarSession::spawn(SessionConfig::default(), bus)?;
        let handle = session.handle();
        let mut phase = handle.watch_phase();

        handle.send_control(ControlSignal::StartSweep).await?;
        handle.send_control(ControlSignal::SweepComplete).await?;

        let fault = tokio::time::timeout(Duration::from_secs(5), alerts.next())
            .await?
            .ok_or("bus closed")?;
        assert!(matches!(fault.payload, EventPayload::Fault { .. }));

        tokio::time::timeout(Duration::from_secs(5), phase.wait_for(|p| *p == ScanPhase::Idle)).await??;
        assert!(handle.room_model().is_none());
        session.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn sweep_complete_outside_sweep_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::Alerts);
        let session = SonarSession::spawn(SessionConfig::default(), bus)?;
        let handle = session.handle();

        handle.send_control(ControlSignal::SweepComplete).await?;
        let fault = tokio::time::timeout(Duration::from_secs(5), alerts.next())
            .await?
            .ok_or("bus closed")?;
        match fault.payload {
            EventPayload::Fault { component, .. } => assert_eq!(component, "session"),
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(handle.phase(), ScanPhase::Idle);
        session.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn simulated_sweep_finalises_room() -> Result<(), Box<dyn std::error::Error>> {
        let config = SessionConfig {
            depth_queue_capacity: 4096,
            ..SessionConfig::default()
        };
        let bus = EventBus::default();
        let mut scan_events = bus.subscribe_to(Topic::Scan);
        let session = SonarSession::spawn(config, bus)?;
        let handle = session.handle();

        let quiet = |sensor| RangeNoise {
            std_meters: 0.005,
            ..RangeNoise::for_sensor(sensor)
        };
        let sim = SimRegistry::builder()
            .with_room(SimRoom::from_dimensions(6.0, 8.0, 2.5, 1.2))
            .with_noisy_range_sensor("lidar", SensorType::Lidar, quiet(SensorType::Lidar))
            .with_noisy_range_sensor("tof", SensorType::TimeOfFlight, quiet(SensorType::TimeOfFlight))
            .with_imu("imu0")
            .with_seed(42);
        let mut registry = sim.build();

        handle.send_control(ControlSignal::StartSweep).await?;

        let t0 = Utc::now();
        for k in 0..20 {
            assert!(handle.push_imu(registry.read_imu("imu0", offset_by_seconds(t0, k as f64 * 0.01))?));
        }
        let mut directions = 0_u64;
        for az_step in 0..72 {
            let azimuth = (az_step as f64 * 5.0).to_radians();
            for el_step in -8..=8 {
                let elevation = (el_step as f64 * 10.0).to_radians();
                let beam = Vec3::from_spherical(azimuth, elevation);
                let ts = offset_by_seconds(t0, 1.0 + directions as f64 * 0.1);
                for reading in registry.sample_all(beam, ts) {
                    assert!(handle.push_depth(reading));
                }
                directions += 1;
            }
        }

        assert!(wait_for(|| handle.stats().fused >= directions).await);
        handle.send_control(ControlSignal::SweepComplete).await?;

        let mut room = handle.watch_room();
        tokio::time::timeout(Duration::from_secs(30), room.wait_for(Option::is_some)).await??;
        let model = handle.room_model().ok_or("no room model")?;

        let long = model.length.max(model.width);
        let short = model.length.min(model.width);
        assert!((long - 8.0).abs() <= 0.4, "long side {long}");
        assert!((short - 6.0).abs() <= 0.3, "short side {short}");
        assert!((model.height - 2.5).abs() <= 0.125, "height {}", model.height);
        assert_eq!(handle.phase(), ScanPhase::Finalized);

        // Phase changes were announced on the scan topic.
        let first = scan_events.next().await.ok_or("bus closed")?;
        assert!(matches!(
            first.payload,
            EventPayload::ScanPhaseChanged {
                phase: ScanPhase::Sweeping,
                ..
            }
        ));

        // A later stop leaves the finalised model untouched.
        handle.send_control(ControlSignal::StopSweep).await?;
        session.shutdown().await?;
        assert_eq!(handle.room_model().map(|m| m.scan_id), Some(model.scan_id));
        Ok(())
    }

    #[tokio::test]
    async fn handle_outlives_session() -> Result<(), Box<dyn std::error::Error>> {
        let session = SonarSession::spawn(SessionConfig::default(), EventBus::default())?;
        let handle = session.handle();
        session.shutdown().await?;
        assert!(handle.send_control(ControlSignal::StartPing).await.is_err());
        assert!(!handle.push_imu(ImuSample {
            timestamp: Utc::now(),
            accelerometer: Vec3::new(0.0, 0.0, 9.8),
            gyroscope: Vec3::zero(),
            magnetometer: None,
        }));
        Ok(())
    }
}

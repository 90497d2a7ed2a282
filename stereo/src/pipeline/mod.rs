//! Pipeline orchestrator
//!
//! Chains source, rectification, disparity, visualization and reprojection in a
//! fixed topology. Every stage runs on the thread that owns the [`Pipeline`]
//! (the driver), except disparity computation, which is dispatched to a worker
//! pool with at most one computation in flight. Triggers arriving while a
//! computation runs are dropped and counted. Finished computations are
//! marshalled back through a channel and published by the driver, so every
//! buffer has a single writer and observers only ever see complete buffers.

mod config;
mod events;
mod stage;

pub use config::{PipelineConfig, THREADED_VAR};
pub use events::PipelineEvent;
pub use stage::{Stage, StageError, StageStatistics};

use crate::params::MethodParams;
use crate::rectification::Rectification;
use crate::reprojection::{PointImage, Reprojection};
use crate::source::{ImagePair, ImagePairSource, SourceNotifier};
use crate::visualization::visualize;
use crate::{DisparityMap, Error, Result, StereoMethod};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use cv_runtime::{DeviceId, DeviceInfo, DeviceRegistry, Executor, FlightPermit, SingleFlight};
use events::EventBus;
use image::{GrayImage, RgbImage};
use stage::StageClock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

type SharedMethod = Arc<Mutex<Box<dyn StereoMethod>>>;

/// Work handed back to the driver thread.
pub(crate) enum DriverMessage {
    SourceChanged { generation: u64 },
    DisparityReady(DisparityCompletion),
}

pub(crate) struct DisparityCompletion {
    epoch: u64,
    generation: u64,
    offset: (i32, i32),
    duration: Duration,
    result: Result<DisparityMap>,
    // Keeps the single-flight slot occupied until the driver is done with the result.
    permit: FlightPermit,
}

#[derive(Debug, Default)]
struct FrameBuffers {
    raw: ImagePair,
    rectified: Arc<ImagePair>,
    disparity: DisparityMap,
    disparity_offset: (i32, i32),
    visualization: RgbImage,
    points: PointImage,
}

pub struct Pipeline {
    config: PipelineConfig,
    source: Option<Box<dyn ImagePairSource>>,
    source_generation: u64,
    rectification: Rectification,
    method: Option<SharedMethod>,
    method_epoch: u64,
    // Bumped whenever the disparity stage is disabled.
    disparity_generation: u64,
    reprojection: Reprojection,
    enabled: [bool; 5],
    clocks: [StageClock; 5],
    buffers: FrameBuffers,
    flight: SingleFlight,
    executor: Executor,
    devices: DeviceRegistry,
    events: EventBus,
    tx: Sender<DriverMessage>,
    rx: Receiver<DriverMessage>,
    shut_down: bool,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        Self::with_devices(config, DeviceRegistry::probe())
    }

    pub fn with_devices(config: PipelineConfig, devices: DeviceRegistry) -> Result<Self> {
        config.validate()?;
        let executor = Executor::new(config.worker_threads, "cv-stereo-disparity")?;
        let (tx, rx) = unbounded();

        let mut reprojection = Reprojection::new();
        reprojection.set_parallel_available(devices.selected().supports_parallel());
        reprojection.set_method(config.reprojection_method);

        tracing::info!(
            threaded = config.threaded,
            pool = executor.name(),
            workers = executor.num_threads(),
            device = %devices.selected().name,
            "pipeline created"
        );
        Ok(Self {
            rectification: Rectification::with_options(config.rectification),
            config,
            source: None,
            source_generation: 0,
            method: None,
            method_epoch: 0,
            disparity_generation: 0,
            reprojection,
            enabled: [true; 5],
            clocks: Default::default(),
            buffers: FrameBuffers::default(),
            flight: SingleFlight::new(),
            executor,
            devices,
            events: EventBus::default(),
            tx,
            rx,
            shut_down: false,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn subscribe(&mut self) -> Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    // ---- collaborators ----

    /// Install a source, stopping the previous one, and pull from it immediately.
    pub fn set_image_pair_source(&mut self, mut source: Box<dyn ImagePairSource>) {
        if let Some(mut old) = self.source.take() {
            old.stop();
        }
        self.source_generation += 1;
        let generation = self.source_generation;
        let tx = self.tx.clone();
        source.attach(SourceNotifier::new(move || {
            let _ = tx.send(DriverMessage::SourceChanged { generation });
        }));
        tracing::info!(source = source.name(), "image source installed");
        self.source = Some(source);
        self.run_source();
    }

    pub fn clear_image_pair_source(&mut self) {
        if let Some(mut old) = self.source.take() {
            old.stop();
        }
        self.source_generation += 1;
    }

    pub fn source_name(&self) -> Option<&str> {
        self.source.as_deref().map(|s| s.name())
    }

    pub fn rectification(&self) -> &Rectification {
        &self.rectification
    }

    pub fn set_rectification(&mut self, rectification: Rectification) {
        self.rectification = rectification;
        self.sync_reprojection_matrix();
        self.run_rectification();
    }

    /// Mutate the rectification (calibration, options, ROI) and re-run the
    /// pipeline from the rectification stage.
    pub fn update_rectification<R>(&mut self, f: impl FnOnce(&mut Rectification) -> R) -> R {
        let out = f(&mut self.rectification);
        self.sync_reprojection_matrix();
        self.run_rectification();
        out
    }

    /// Install a disparity method. A computation still running with the previous
    /// method finishes, its result is discarded and the stage re-runs.
    pub fn set_stereo_method(&mut self, method: Box<dyn StereoMethod>) {
        tracing::info!(method = method.name(), "stereo method installed");
        self.method = Some(Arc::new(Mutex::new(method)));
        self.method_changed();
    }

    pub fn stereo_method_name(&self) -> Option<String> {
        self.method.as_ref().map(|m| lock(m).name().to_string())
    }

    /// Mutate the current method and re-run the disparity stage. Blocks while a
    /// computation with this method is running.
    pub fn update_stereo_method<R>(
        &mut self,
        f: impl FnOnce(&mut dyn StereoMethod) -> R,
    ) -> Result<R> {
        let method = self.require_method()?;
        let out = {
            let mut guard = lock(&method);
            f(&mut **guard)
        };
        self.method_changed();
        Ok(out)
    }

    pub fn save_method_params<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let method = self.require_method()?;
        let params = lock(&method).export_params();
        params.save(path)
    }

    /// Load parameters into the current method. Parameters exported by a
    /// different method are rejected.
    pub fn load_method_params<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let params = MethodParams::load(path)?;
        self.update_stereo_method(|m| m.import_params(&params))?
    }

    fn require_method(&self) -> Result<SharedMethod> {
        self.method
            .clone()
            .ok_or_else(|| Error::ConfigError("no stereo method installed".to_string()))
    }

    fn method_changed(&mut self) {
        self.method_epoch += 1;
        if self.flight.is_busy() {
            tracing::debug!("stereo method changed during computation, result will be discarded");
        } else {
            self.run_disparity();
        }
    }

    pub fn reprojection(&self) -> &Reprojection {
        &self.reprojection
    }

    pub fn set_reprojection(&mut self, reprojection: Reprojection) {
        self.reprojection = reprojection;
        self.reprojection
            .set_parallel_available(self.devices.selected().supports_parallel());
        self.sync_reprojection_matrix();
        self.run_reprojection();
    }

    pub fn update_reprojection<R>(&mut self, f: impl FnOnce(&mut Reprojection) -> R) -> R {
        let out = f(&mut self.reprojection);
        self.run_reprojection();
        out
    }

    fn sync_reprojection_matrix(&mut self) {
        match self.rectification.q() {
            Some(q) => self.reprojection.set_reprojection_matrix(q),
            None => self.reprojection.clear_reprojection_matrix(),
        }
    }

    // ---- stage state ----

    pub fn stage_enabled(&self, stage: Stage) -> bool {
        self.enabled[stage.index()]
    }

    /// Enable or disable a stage. Enabling re-runs the stage from the latest
    /// upstream data; disabling idles it. Returns whether anything changed.
    pub fn set_stage_enabled(&mut self, stage: Stage, enabled: bool) -> bool {
        if !stage.is_toggleable() {
            tracing::warn!(%stage, "stage cannot be toggled");
            return false;
        }
        if self.shut_down || self.enabled[stage.index()] == enabled {
            return false;
        }
        self.enabled[stage.index()] = enabled;
        tracing::debug!(%stage, enabled, "stage state changed");
        self.events
            .publish(PipelineEvent::StageStateChanged { stage, enabled });

        if !enabled {
            if stage == Stage::Disparity {
                self.disparity_generation += 1;
            }
            self.events.publish(PipelineEvent::ProcessingCompleted);
            return true;
        }

        self.clocks[stage.index()].reset();
        match stage {
            Stage::Source => self.run_source(),
            Stage::Rectification => self.run_rectification(),
            Stage::Disparity => {
                self.flight.reset_dropped();
                if !self.flight.is_busy() {
                    self.run_disparity();
                }
            }
            Stage::Reprojection => self.run_reprojection(),
            Stage::Visualization => {}
        }
        true
    }

    pub fn statistics(&self, stage: Stage) -> StageStatistics {
        let mut stats = self.clocks[stage.index()].statistics();
        if stage == Stage::Disparity {
            stats.dropped_frames = self.flight.dropped();
        }
        stats
    }

    /// Whether a disparity computation is running or waiting to be published.
    pub fn is_computing(&self) -> bool {
        self.flight.is_busy()
    }

    // ---- buffers ----

    pub fn left_raw(&self) -> &GrayImage {
        &self.buffers.raw.left
    }

    pub fn right_raw(&self) -> &GrayImage {
        &self.buffers.raw.right
    }

    pub fn left_rectified(&self) -> &GrayImage {
        &self.buffers.rectified.left
    }

    pub fn right_rectified(&self) -> &GrayImage {
        &self.buffers.rectified.right
    }

    pub fn disparity(&self) -> &DisparityMap {
        &self.buffers.disparity
    }

    pub fn visualization(&self) -> &RgbImage {
        &self.buffers.visualization
    }

    pub fn points(&self) -> &PointImage {
        &self.buffers.points
    }

    // ---- devices ----

    pub fn devices(&self) -> &[DeviceInfo] {
        self.devices.devices()
    }

    pub fn selected_device(&self) -> &DeviceInfo {
        self.devices.selected()
    }

    /// Select a compute device. Back-ends the device cannot serve become
    /// unavailable; unknown ids are ignored.
    pub fn select_device(&mut self, id: DeviceId) -> bool {
        if !self.devices.select(id) {
            return false;
        }
        let parallel = self.devices.selected().supports_parallel();
        let before = self.reprojection.method();
        self.reprojection.set_parallel_available(parallel);
        if self.reprojection.method() != before {
            self.run_reprojection();
        }
        true
    }

    // ---- driving ----

    /// Pull a new pair from the source and run the pipeline on it.
    pub fn process_frame(&mut self) {
        self.run_source();
    }

    /// Handle every pending source notification and finished computation
    /// without blocking. Returns the number of messages handled.
    pub fn process_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(msg) = self.rx.try_recv() {
            self.handle(msg);
            handled += 1;
        }
        handled
    }

    /// Wait up to `timeout` for a message, then drain the queue.
    pub fn process_events_timeout(&mut self, timeout: Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => {
                self.handle(msg);
                1 + self.process_events()
            }
            Err(_) => 0,
        }
    }

    /// Block until no disparity computation is in flight, publishing results as
    /// they arrive. Returns false on timeout.
    pub fn wait_for_disparity(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.flight.is_busy() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            match self.rx.recv_timeout(deadline - now) {
                Ok(msg) => self.handle(msg),
                Err(RecvTimeoutError::Timeout) => return false,
                Err(RecvTimeoutError::Disconnected) => return !self.flight.is_busy(),
            }
        }
        true
    }

    fn handle(&mut self, msg: DriverMessage) {
        match msg {
            DriverMessage::SourceChanged { generation } => {
                if generation == self.source_generation {
                    self.run_source();
                }
            }
            DriverMessage::DisparityReady(completion) => self.finish_disparity(completion),
        }
    }

    /// Disable every stage, stop the source and wait for the worker pool to
    /// drain. Late results are discarded.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        for stage in Stage::ALL.into_iter().filter(Stage::is_toggleable) {
            self.set_stage_enabled(stage, false);
        }
        self.shut_down = true;
        if let Some(source) = self.source.as_mut() {
            source.stop();
        }
        let pending = self.executor.load();
        if pending > 0 {
            tracing::debug!(pending, "waiting for disparity workers");
        }
        self.executor.wait_idle();
        let discarded = self.rx.try_iter().count();
        tracing::info!(discarded, "pipeline shut down");
    }

    // ---- stages ----

    fn report(&mut self, stage: Stage, error: &Error) {
        tracing::warn!(%stage, "{error}");
        self.events
            .publish(PipelineEvent::Error(StageError::new(stage, error)));
    }

    fn idle(&mut self) {
        self.events.publish(PipelineEvent::ProcessingCompleted);
    }

    fn record(&mut self, stage: Stage, duration: Duration) {
        let fps = self.clocks[stage.index()].record(duration, self.config.fps_smoothing);
        self.events.publish(PipelineEvent::FrameRate { stage, fps });
    }

    fn run_source(&mut self) {
        if self.shut_down || !self.stage_enabled(Stage::Source) {
            return self.idle();
        }
        let Some(source) = self.source.as_mut() else {
            self.report(
                Stage::Source,
                &Error::ConfigError("no image source installed".to_string()),
            );
            return self.idle();
        };

        let start = Instant::now();
        match source.images() {
            Ok(pair) => {
                self.buffers.raw = pair;
                self.record(Stage::Source, start.elapsed());
                self.events.publish(PipelineEvent::InputImagesChanged);
                self.run_rectification();
            }
            Err(e) => {
                self.buffers.raw = ImagePair::empty();
                self.events.publish(PipelineEvent::InputImagesChanged);
                self.report(Stage::Source, &e);
                self.idle();
            }
        }
    }

    fn clear_rectified(&mut self) {
        self.buffers.rectified = Arc::new(ImagePair::empty());
        self.events.publish(PipelineEvent::RectifiedImagesChanged);
    }

    fn run_rectification(&mut self) {
        if self.shut_down || !self.stage_enabled(Stage::Rectification) {
            return self.idle();
        }
        let raw = &self.buffers.raw;
        if raw.is_empty() {
            self.clear_rectified();
            return self.idle();
        }
        if !raw.same_size() {
            let err = Error::dimension_mismatch(format!(
                "left image is {}x{} but right image is {}x{}",
                raw.left.width(),
                raw.left.height(),
                raw.right.width(),
                raw.right.height()
            ));
            self.clear_rectified();
            self.report(Stage::Rectification, &err);
            return self.idle();
        }

        let start = Instant::now();
        match self.rectification.rectify_pair(&raw.left, &raw.right) {
            Ok((left, right)) => {
                self.buffers.rectified = Arc::new(ImagePair::new(left, right));
                self.record(Stage::Rectification, start.elapsed());
                self.events.publish(PipelineEvent::RectifiedImagesChanged);
                self.run_disparity();
            }
            Err(e) => {
                self.clear_rectified();
                self.report(Stage::Rectification, &e);
                self.idle();
            }
        }
    }

    fn run_disparity(&mut self) {
        if self.shut_down || !self.stage_enabled(Stage::Disparity) {
            return self.idle();
        }
        let Some(method) = self.method.clone() else {
            self.report(
                Stage::Disparity,
                &Error::ConfigError("no stereo method installed".to_string()),
            );
            return self.idle();
        };
        if self.buffers.rectified.is_empty() {
            self.publish_disparity(DisparityMap::empty(), (0, 0));
            return;
        }

        let Some(permit) = self.flight.try_acquire() else {
            let count = self.flight.dropped();
            tracing::debug!(count, "disparity computation busy, dropping frame");
            self.events.publish(PipelineEvent::DroppedFrames {
                stage: Stage::Disparity,
                count,
            });
            return;
        };

        let pair = self.buffers.rectified.clone();
        let dispatch = Dispatch {
            epoch: self.method_epoch,
            generation: self.disparity_generation,
            offset: self.rectification.roi_offset(),
        };

        if self.config.threaded {
            let tx = self.tx.clone();
            self.executor.spawn(move || {
                let completion = compute_disparity(&method, &pair, dispatch, permit);
                let _ = tx.send(DriverMessage::DisparityReady(completion));
            });
        } else {
            let completion = compute_disparity(&method, &pair, dispatch, permit);
            self.finish_disparity(completion);
        }
    }

    fn finish_disparity(&mut self, completion: DisparityCompletion) {
        if self.shut_down {
            return;
        }
        // A result dispatched before a method swap or a disable/enable cycle no
        // longer matches the current input. Rerun on the latest rectified pair;
        // run_disparity idles if the stage is still disabled.
        if completion.epoch != self.method_epoch {
            tracing::debug!("discarding disparity computed by a replaced stereo method");
            drop(completion);
            return self.run_disparity();
        }
        if completion.generation != self.disparity_generation {
            tracing::debug!("discarding disparity dispatched before the stage was disabled");
            drop(completion);
            return self.run_disparity();
        }

        let DisparityCompletion {
            offset,
            duration,
            result,
            permit,
            ..
        } = completion;
        // Free the slot before publishing; downstream stages run inline.
        drop(permit);

        match result {
            Ok(map) => {
                self.record(Stage::Disparity, duration);
                self.publish_disparity(map, offset);
            }
            Err(e) => {
                self.report(Stage::Disparity, &e);
                self.publish_disparity(DisparityMap::empty(), (0, 0));
            }
        }
    }

    fn publish_disparity(&mut self, map: DisparityMap, offset: (i32, i32)) {
        self.buffers.disparity = map;
        self.buffers.disparity_offset = offset;
        self.events.publish(PipelineEvent::DisparityChanged);
        self.run_visualization();
        self.run_reprojection();
    }

    fn run_visualization(&mut self) {
        let start = Instant::now();
        self.buffers.visualization = visualize(&self.buffers.disparity, self.config.colormap);
        if !self.buffers.disparity.is_empty() {
            self.record(Stage::Visualization, start.elapsed());
        }
        self.events.publish(PipelineEvent::VisualizationChanged);
    }

    fn run_reprojection(&mut self) {
        if self.shut_down || !self.stage_enabled(Stage::Reprojection) {
            return self.idle();
        }
        let (ox, oy) = self.buffers.disparity_offset;
        let start = Instant::now();
        match self.reprojection.reproject(&self.buffers.disparity, ox, oy) {
            Ok(points) => {
                if !points.is_empty() {
                    self.record(Stage::Reprojection, start.elapsed());
                }
                self.buffers.points = points;
            }
            Err(e) => {
                self.buffers.points = PointImage::empty();
                self.report(Stage::Reprojection, &e);
            }
        }
        self.events.publish(PipelineEvent::PointsChanged);
        self.idle();
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock(method: &SharedMethod) -> std::sync::MutexGuard<'_, Box<dyn StereoMethod>> {
    method.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Driver state captured when a computation is handed out.
#[derive(Debug, Clone, Copy)]
struct Dispatch {
    epoch: u64,
    generation: u64,
    offset: (i32, i32),
}

fn compute_disparity(
    method: &SharedMethod,
    pair: &ImagePair,
    dispatch: Dispatch,
    permit: FlightPermit,
) -> DisparityCompletion {
    let start = Instant::now();
    let mut guard = lock(method);
    let result = match catch_unwind(AssertUnwindSafe(|| {
        guard.compute_disparity(&pair.left, &pair.right)
    })) {
        Ok(result) => result
            .map_err(|e| method_failure(e, guard.name()))
            .and_then(|map| check_disparity(map, guard.name())),
        Err(_) => Err(Error::AlgorithmError(format!(
            "stereo method '{}' panicked",
            guard.name()
        ))),
    };
    drop(guard);

    DisparityCompletion {
        epoch: dispatch.epoch,
        generation: dispatch.generation,
        offset: dispatch.offset,
        duration: start.elapsed(),
        result,
        permit,
    }
}

/// Whatever a method reports, a failed computation is an algorithm failure.
fn method_failure(error: Error, method: &str) -> Error {
    match error {
        Error::AlgorithmError(_) => error,
        other => Error::AlgorithmError(format!("stereo method '{method}' failed: {other}")),
    }
}

fn check_disparity(map: DisparityMap, method: &str) -> Result<DisparityMap> {
    if map.data.len() != (map.width as usize) * (map.height as usize) {
        return Err(Error::AlgorithmError(format!(
            "stereo method '{method}' returned {} values for a {}x{} map",
            map.data.len(),
            map.width,
            map.height
        )));
    }
    Ok(map)
}

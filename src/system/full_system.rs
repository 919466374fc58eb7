//! The odometry system: frame intake, initialisation, coarse tracking,
//! keyframe creation and the mapping loop.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{EnergyBackend, SlidingWindowBackend};
use crate::calib::Calibration;
use crate::frame::pyramid::FramePyramid;
use crate::frame::shell::{AffLight, FrameId, FrameStore};
use crate::geometry::SE3;
use crate::imu::{ImuIntegration, ImuSample, NoImu};
use crate::init::CoarseInit;
use crate::point::immature::DepthInterval;
use crate::point::pattern::PATTERN_PADDING;
use crate::point::{ActivePoint, ImmaturePoint, TraceStatus};
use crate::select::{GradientGridSelector, PixelSelector};
use crate::settings::Settings;
use crate::system::pipeline::{
    decide_map_action, MapAction, Pipeline, TrackedFrame, CATCH_UP_QUEUE_DEPTH,
};
use crate::system::reduce::ReducePool;
use crate::tracking::coarse::{track_new_coarse, CoarseTracker};
use crate::tracking::kernel::PyramidKernel;
use crate::tracking::keyframe_decision::{KeyframeCues, KeyframeDecision};
use crate::window::activation::PointActivator;
use crate::window::distance_map::CoarseDistanceMap;
use crate::window::SlidingWindow;

/// One input frame.
pub struct ImageInput<'a> {
    /// Grayscale intensities, row major, full resolution.
    pub pixels: &'a [f32],
    /// Exposure time in milliseconds (0 when unknown).
    pub exposure: f32,
    /// Capture timestamp in seconds.
    pub timestamp: f64,
    /// Caller-side frame id.
    pub incoming_id: usize,
    /// Inertial samples since the previous frame.
    pub imu_samples: &'a [ImuSample],
}

/// Mapping-side state, guarded by the map mutex.
pub struct MapState {
    pub window: SlidingWindow,
    pub backend: Box<dyn SlidingWindowBackend>,
    pub selector: Box<dyn PixelSelector>,
    pub activator: PointActivator,
    pub dmap: CoarseDistanceMap,
    pub pool: ReducePool,
    selection_map: Vec<f32>,
}

/// The two coarse-tracker slots and their swap gate.
pub struct TrackerPair {
    pub serving: Mutex<CoarseTracker>,
    pub prepared: Mutex<CoarseTracker>,
    serving_ref: AtomicI64,
    prepared_ref: AtomicI64,
    swap_gate: Mutex<()>,
}

impl TrackerPair {
    fn new(serving: CoarseTracker, prepared: CoarseTracker) -> Self {
        Self {
            serving: Mutex::new(serving),
            prepared: Mutex::new(prepared),
            serving_ref: AtomicI64::new(-1),
            prepared_ref: AtomicI64::new(-1),
            swap_gate: Mutex::new(()),
        }
    }

    /// Swap the slots when the prepared tracker has a newer reference.
    /// Only the exchange itself is gated.
    pub fn maybe_swap(&self) -> bool {
        if self.prepared_ref.load(Ordering::SeqCst) <= self.serving_ref.load(Ordering::SeqCst) {
            return false;
        }
        let _gate = self.swap_gate.lock();
        let mut serving = self.serving.lock();
        let mut prepared = self.prepared.lock();
        std::mem::swap(&mut *serving, &mut *prepared);
        let s = self.serving_ref.load(Ordering::SeqCst);
        self.serving_ref
            .store(self.prepared_ref.load(Ordering::SeqCst), Ordering::SeqCst);
        self.prepared_ref.store(s, Ordering::SeqCst);
        true
    }

    /// Rebuild the prepared tracker against the newest keyframe.
    pub fn prepare_for_new_keyframe(&self, window: &SlidingWindow, calib: &Calibration) {
        let _gate = self.swap_gate.lock();
        let mut prepared = self.prepared.lock();
        prepared.make_k(calib);
        prepared.set_ref(window);
        if let Some(id) = prepared.ref_keyframe {
            self.prepared_ref.store(id.0 as i64, Ordering::SeqCst);
        }
    }

    pub fn has_any_ref(&self) -> bool {
        self.serving_ref.load(Ordering::SeqCst) >= 0
            || self.prepared_ref.load(Ordering::SeqCst) >= 0
    }

    pub fn serving_ref_id(&self) -> i64 {
        self.serving_ref.load(Ordering::SeqCst)
    }
}

/// State shared between the tracking and mapping threads.
pub struct SystemShared {
    pub settings: Settings,
    pub calib: Calibration,
    /// Shell-pose mutex: every per-frame pose read/write goes through it.
    pub frames: Mutex<FrameStore>,
    /// Map mutex: serialises all window mutation and history traversal.
    pub map: Mutex<MapState>,
    pub trackers: TrackerPair,
    pub pipeline: Pipeline,
    pub imu: Mutex<Box<dyn ImuIntegration>>,
    /// Frames promoted to keyframes, in promotion order.
    pub keyframe_history: Mutex<Vec<FrameId>>,
    /// World pose of the first keyframe; fixed at initialisation.
    pub first_pose: Mutex<SE3>,

    pub initialized: AtomicBool,
    pub is_lost: AtomicBool,
    pub init_failed: AtomicBool,
    pub full_reset_requested: AtomicBool,
}

/// The visual-inertial odometry front-end.
///
/// Feed frames with [`process_frame`](OdometrySystem::process_frame);
/// mapping runs on a background thread unless
/// `settings.linearize_operation` selects the synchronous mode.
pub struct OdometrySystem {
    shared: Arc<SystemShared>,
    initializer: Box<dyn CoarseInit>,
    decision: KeyframeDecision,
    last_coarse_rmse: [f64; 5],
    second_keyframe_done: bool,
    mapping_handle: Option<JoinHandle<()>>,
}

impl OdometrySystem {
    /// Build a system with the built-in reference collaborators.
    pub fn new(calib: Calibration, settings: Settings) -> Self {
        let kernel_a = Box::new(PyramidKernel::new(&settings));
        let kernel_b = Box::new(PyramidKernel::new(&settings));
        let initializer = Box::new(crate::init::TwoFrameInit::new(&settings));
        Self::with_parts(
            calib,
            settings,
            Box::new(EnergyBackend::new()),
            kernel_a,
            kernel_b,
            Box::new(GradientGridSelector::new()),
            initializer,
            Box::new(NoImu::new()),
        )
    }

    /// Build a system with explicit collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn with_parts(
        calib: Calibration,
        settings: Settings,
        backend: Box<dyn SlidingWindowBackend>,
        kernel_serving: Box<dyn crate::tracking::TrackerKernel>,
        kernel_prepared: Box<dyn crate::tracking::TrackerKernel>,
        selector: Box<dyn PixelSelector>,
        initializer: Box<dyn CoarseInit>,
        imu: Box<dyn ImuIntegration>,
    ) -> Self {
        let mut serving = CoarseTracker::new(kernel_serving);
        let mut prepared = CoarseTracker::new(kernel_prepared);
        serving.make_k(&calib);
        prepared.make_k(&calib);

        let map = MapState {
            window: SlidingWindow::new(),
            backend,
            selector,
            activator: PointActivator::new(),
            dmap: CoarseDistanceMap::new(&calib),
            pool: ReducePool::new(settings.num_threads),
            selection_map: vec![0.0; calib.width(0) * calib.height(0)],
        };

        let shared = Arc::new(SystemShared {
            settings: settings.clone(),
            calib,
            frames: Mutex::new(FrameStore::new()),
            map: Mutex::new(map),
            trackers: TrackerPair::new(serving, prepared),
            pipeline: Pipeline::new(),
            imu: Mutex::new(imu),
            keyframe_history: Mutex::new(Vec::new()),
            first_pose: Mutex::new(SE3::identity()),
            initialized: AtomicBool::new(false),
            is_lost: AtomicBool::new(false),
            init_failed: AtomicBool::new(false),
            full_reset_requested: AtomicBool::new(false),
        });

        let mapping_handle = if settings.linearize_operation {
            None
        } else {
            let shared_map = shared.clone();
            Some(std::thread::spawn(move || mapping_loop(&shared_map)))
        };

        Self {
            shared,
            initializer,
            decision: KeyframeDecision::new(),
            last_coarse_rmse: [100.0; 5],
            second_keyframe_done: false,
            mapping_handle,
        }
    }

    pub fn shared(&self) -> &Arc<SystemShared> {
        &self.shared
    }

    pub fn is_lost(&self) -> bool {
        self.shared.is_lost.load(Ordering::SeqCst)
    }

    pub fn init_failed(&self) -> bool {
        self.shared.init_failed.load(Ordering::SeqCst)
    }

    pub fn initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    /// A full reset was requested; the driver should rebuild the system
    /// before the next frame.
    pub fn full_reset_requested(&self) -> bool {
        self.shared.full_reset_requested.load(Ordering::SeqCst)
    }

    /// Feed one frame through the front-end.
    pub fn process_frame(&mut self, input: &ImageInput) -> Result<()> {
        if self.is_lost() {
            return Ok(());
        }

        let frame_id = self
            .shared
            .frames
            .lock()
            .push(input.incoming_id, input.timestamp, input.exposure);
        let pyramid = Arc::new(FramePyramid::build(input.pixels, &self.shared.calib));

        if !self.shared.initialized.load(Ordering::SeqCst) {
            return self.initializer_step(frame_id, pyramid, input);
        }
        self.frontend_step(frame_id, pyramid, input)
    }

    /// Initialisation path: anchor on the first frame, track until the
    /// initialiser snaps, restart when the attempt takes too long.
    fn initializer_step(
        &mut self,
        frame_id: FrameId,
        pyramid: Arc<FramePyramid>,
        input: &ImageInput,
    ) -> Result<()> {
        let settings = &self.shared.settings;

        if self.initializer.first_frame().is_none() {
            self.initializer
                .set_first(&self.shared.calib, frame_id, &pyramid);
            if settings.use_imu {
                self.shared.imu.lock().gravity_measure(input.imu_samples);
            }
            info!(frame = %frame_id, "initialisation anchor set");
            return Ok(());
        }

        let snapped = self.initializer.track_frame(&pyramid);
        if settings.use_imu {
            let mut imu = self.shared.imu.lock();
            imu.add_imu_data_to_ba(input.imu_samples);
            let imu_to_world = imu.gravity_measure(input.imu_samples);
            if snapped {
                *self.shared.first_pose.lock() = imu_to_world;
            }
        }

        if snapped {
            self.initialize_from_initializer(frame_id, &pyramid)?;
            self.deliver_tracked_frame(TrackedFrame {
                frame: frame_id,
                pyramid,
                need_kf: true,
            });
            return Ok(());
        }

        let (first_id, _) = self.initializer.first_frame().expect("anchor is set");
        let gap = {
            let frames = self.shared.frames.lock();
            input.timestamp - frames.get(first_id).timestamp
        };
        if gap > settings.max_time_between_init_frames {
            warn!(gap, "initialisation window expired; requesting full reset");
            self.shared
                .full_reset_requested
                .store(true, Ordering::SeqCst);
        } else {
            self.shared.frames.lock().get_mut(frame_id).pose_valid = false;
        }
        Ok(())
    }

    /// Tracked path: coarse tracking, keyframe decision, delivery.
    fn frontend_step(
        &mut self,
        frame_id: FrameId,
        pyramid: Arc<FramePyramid>,
        input: &ImageInput,
    ) -> Result<()> {
        let settings = self.shared.settings.clone();
        let ref_changed = self.shared.trackers.maybe_swap();

        let mut hint = None;
        if settings.use_imu {
            let mut imu = self.shared.imu.lock();
            if ref_changed {
                imu.init_coarse_graph();
            }
            let last_ref = (self.shared.trackers.serving_ref_id() >= 0).then(|| {
                self.shared.trackers.serving.lock().ref_frame.expect("serving has ref")
            });
            hint = imu.add_imu_data(
                input.imu_samples,
                frame_id,
                input.timestamp,
                ref_changed,
                last_ref,
            );
            if !imu.coarse_initialized() {
                hint = None;
            }
            imu.add_imu_data_to_ba(input.imu_samples);
        }

        let result = {
            let mut serving = self.shared.trackers.serving.lock();
            let mut frames = self.shared.frames.lock();
            track_new_coarse(
                &mut serving,
                &mut frames,
                frame_id,
                &pyramid,
                hint.as_ref(),
                &mut self.last_coarse_rmse,
                &self.shared.calib,
                &settings,
            )?
        };

        let mut force_no_kf = !result.tracking_good;
        let mut force_kf = false;
        let cues_finite =
            result.rmse.is_finite() && result.flow.iter().all(|f| f.is_finite());
        if !cues_finite {
            if settings.use_imu {
                force_no_kf = false;
                force_kf = true;
            } else {
                warn!("initial tracking failed: lost");
                self.shared.is_lost.store(true, Ordering::SeqCst);
                return Ok(());
            }
        }

        let (history_len, frames_since_kf, aff_transfer_a, last_kf_timestamp, baseline) = {
            let frames = self.shared.frames.lock();
            let shell = frames.get(frame_id);
            let tracking_ref = shell.tracking_ref.expect("tracked frame has a reference");
            let history = self.shared.keyframe_history.lock();
            let last_kf = *history.last().expect("initialised system has keyframes");
            let serving = self.shared.trackers.serving.lock();
            let aff = AffLight::from_to_vec_exposure(
                serving.ref_exposure,
                shell.exposure,
                serving.ref_aff,
                shell.aff_g2l,
            );
            (
                frames.len() - 1,
                frame_id.0 - tracking_ref.0 - 1,
                aff.0,
                frames.get(last_kf).timestamp,
                shell.cam_to_tracking_ref.translation.norm(),
            )
        };

        let scaled_baseline = {
            let imu = self.shared.imu.lock();
            imu.coarse_initialized().then(|| baseline * imu.coarse_scale())
        };
        let first_coarse_rmse = self.shared.trackers.serving.lock().first_coarse_rmse;

        let cues = KeyframeCues {
            history_len,
            timestamp: input.timestamp,
            last_kf_timestamp,
            flow: result.flow,
            rmse: result.rmse,
            aff_transfer_a,
            first_coarse_rmse,
            dimension_sum: (self.shared.calib.width(0) + self.shared.calib.height(0)) as f64,
            force_kf,
            force_no_kf,
            scaled_baseline,
            frames_since_kf,
        };
        let need_kf = self.decision.decide(&cues, &settings);

        if settings.use_imu {
            let frames = self.shared.frames.lock();
            self.shared
                .imu
                .lock()
                .finish_coarse_tracking(frames.get(frame_id), need_kf);
        }

        self.deliver_tracked_frame(TrackedFrame {
            frame: frame_id,
            pyramid,
            need_kf,
        });
        Ok(())
    }

    /// Hand a tracked frame to the mapper (or map it inline in
    /// sequential mode).
    fn deliver_tracked_frame(&mut self, mut fh: TrackedFrame) {
        let settings = &self.shared.settings;
        let use_imu = settings.use_imu;

        let already_prepared = {
            let imu = self.shared.imu.lock();
            use_imu && imu.prepared_keyframe().is_some() && !settings.linearize_operation
        };

        if (fh.need_kf || (!self.second_keyframe_done && !settings.linearize_operation))
            && use_imu
            && !already_prepared
        {
            let mut imu = self.shared.imu.lock();
            imu.prepare_keyframe(fh.frame);
            if !fh.need_kf {
                self.second_keyframe_done = true;
            }
        }

        if settings.linearize_operation {
            if fh.need_kf {
                if use_imu {
                    self.shared.imu.lock().keyframe_created(fh.frame);
                }
                make_keyframe(&self.shared, &fh);
            } else {
                make_non_keyframe(&self.shared, &fh);
            }
            return;
        }

        let mut state = self.shared.pipeline.state.lock();

        // Re-promotion: if the prepared keyframe is still queued, this
        // frame takes its place.
        if already_prepared && !self.shared.imu.lock().prepared_keyframe_created() {
            self.shared.imu.lock().prepare_keyframe(fh.frame);
            fh.need_kf = true;
        }

        if fh.need_kf {
            state.need_new_kf_after = if use_imu {
                self.shared
                    .imu
                    .lock()
                    .prepared_keyframe()
                    .map(|f| f.0 as i64)
                    .unwrap_or(-1)
            } else {
                let frames = self.shared.frames.lock();
                frames
                    .get(fh.frame)
                    .tracking_ref
                    .map(|f| f.0 as i64)
                    .unwrap_or(-1)
            };
        }
        state.unmapped.push_back(fh);
        self.shared.pipeline.tracked_cv.notify_all();

        while !self.shared.trackers.has_any_ref() {
            self.shared
                .pipeline
                .mapped_cv
                .wait(&mut state);
        }
    }

    /// Promote the initialiser result into the first two keyframes.
    fn initialize_from_initializer(
        &mut self,
        new_frame: FrameId,
        _new_pyramid: &Arc<FramePyramid>,
    ) -> Result<()> {
        let settings = self.shared.settings.clone();
        let (first_id, first_pyr) = self.initializer.first_frame().expect("anchor is set");
        let candidates = self.initializer.candidates().to_vec();

        // The original carried additional running-mean accumulators here
        // that were never incremented; only this sum feeds the rescale.
        let mut sum_ir = 1e-5f32;
        let mut num_ir = 1e-5f32;
        for c in &candidates {
            sum_ir += c.i_r;
            num_ir += 1.0;
        }
        let rescale_factor = 1.0 / (sum_ir / num_ir);

        let mut first_to_new = self.initializer.this_to_next();
        first_to_new.translation /= rescale_factor as f64;
        info!(rescale_factor, "initialisation snapped");

        let first_pose = self.shared.first_pose.lock().clone();
        let mut map = self.shared.map.lock();
        let mut frames = self.shared.frames.lock();

        let exposure = frames.get(first_id).exposure;
        let kf_id = map
            .window
            .push_keyframe(first_id, first_pyr, exposure, first_pose.clone(), AffLight::zero());
        map.window.set_precalc_values(&self.shared.calib);
        map.backend.insert_frame(kf_id);
        self.shared.keyframe_history.lock().push(first_id);

        // Keep a random subset of candidates sized to the target density.
        use rand::Rng;
        let keep_percentage = settings.desired_point_density / candidates.len() as f32;
        let mut kept = 0usize;
        let mut rng = rand::thread_rng();
        for c in &candidates {
            if rng.gen::<f32>() > keep_percentage {
                continue;
            }
            let Some(mut imm) = ImmaturePoint::new(
                c.u + 0.5,
                c.v + 0.5,
                kf_id,
                &map.window.keyframes()[0].pyramid.clone(),
                c.point_type,
                &settings,
            ) else {
                continue;
            };
            imm.interval = DepthInterval::Bounded { min: 1.0, max: 1.0 };
            let mut point = ActivePoint::from_immature(&imm, c.i_r * rescale_factor);
            point.has_depth_prior = true;
            map.window.keyframes_mut()[0].active_points.push(point);
            map.backend.insert_point(kf_id);
            kept += 1;
        }
        info!(
            kept,
            available = candidates.len(),
            "initialisation points sub-selected"
        );

        {
            let shell = frames.get_mut(first_id);
            shell.cam_to_world = first_pose.clone();
            shell.aff_g2l = AffLight::zero();
            shell.tracking_ref = None;
            shell.cam_to_tracking_ref = SE3::identity();
            shell.keyframe_id = Some(0);
            shell.pose_valid = true;
        }
        {
            let shell = frames.get_mut(new_frame);
            shell.cam_to_world = &first_pose * &first_to_new.inverse();
            shell.aff_g2l = AffLight::zero();
            shell.tracking_ref = Some(first_id);
            shell.cam_to_tracking_ref = first_to_new.inverse();
            shell.pose_valid = true;
        }
        drop(frames);
        drop(map);

        if settings.use_imu {
            let frames = self.shared.frames.lock();
            self.shared
                .imu
                .lock()
                .finish_coarse_tracking(frames.get(new_frame), true);
        }

        self.shared.initialized.store(true, Ordering::SeqCst);
        info!(points = kept, "initialised from initialiser");
        Ok(())
    }

    /// Stop the mapping thread and wait for it.
    pub fn shutdown(&mut self) {
        self.shared.pipeline.request_stop();
        if let Some(handle) = self.mapping_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for OdometrySystem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Mapping thread body.
fn mapping_loop(shared: &Arc<SystemShared>) {
    loop {
        let (fh, queue_len, catch_up, need_new_kf_after) = {
            let mut state = shared.pipeline.state.lock();
            while state.unmapped.is_empty() {
                if !state.run_mapping {
                    info!("mapping finished");
                    return;
                }
                shared.pipeline.tracked_cv.wait(&mut state);
            }
            if !state.run_mapping {
                info!("mapping finished");
                return;
            }
            let fh = state.unmapped.pop_front().expect("queue non-empty");
            if state.unmapped.len() > CATCH_UP_QUEUE_DEPTH {
                state.catch_up = true;
            }
            (
                fh,
                state.unmapped.len(),
                state.catch_up,
                state.need_new_kf_after,
            )
        };

        let keyframes_so_far = shared.keyframe_history.lock().len();
        let creates_kf = if shared.settings.use_imu {
            need_new_kf_after == fh.frame.0 as i64
        } else {
            let map = shared.map.lock();
            map.window
                .newest()
                .map(|kf| need_new_kf_after >= kf.frame.0 as i64)
                .unwrap_or(false)
        };

        let action = decide_map_action(
            keyframes_so_far,
            queue_len,
            catch_up,
            creates_kf,
            shared.settings.real_time_max_kf,
        );

        match action {
            MapAction::KeyFrame => {
                if shared.settings.use_imu {
                    shared.imu.lock().keyframe_created(fh.frame);
                }
                make_keyframe(shared, &fh);
                let mut state = shared.pipeline.state.lock();
                state.catch_up = false;
            }
            MapAction::NonKeyFrame => {
                if shared.settings.use_imu && need_new_kf_after == fh.frame.0 as i64 {
                    warn!("prepared keyframe was skipped by the backlog");
                    shared.imu.lock().skip_prepared_keyframe();
                }
                make_non_keyframe(shared, &fh);
            }
            MapAction::NonKeyFrameAndDrain => {
                make_non_keyframe(shared, &fh);
                // Close the gap: advance one more frame's pose without
                // mapping it.
                let drained = shared.pipeline.state.lock().unmapped.pop_front();
                if let Some(extra) = drained {
                    let mut frames = shared.frames.lock();
                    frames.compose_from_ref(extra.frame);
                }
            }
        }
        shared.pipeline.mapped_cv.notify_all();
    }
}

/// Map a frame without promoting it: update its pose from the reference
/// chain and trace all immature points against it.
pub(crate) fn make_non_keyframe(shared: &Arc<SystemShared>, fh: &TrackedFrame) {
    {
        let mut frames = shared.frames.lock();
        frames.compose_from_ref(fh.frame);
    }
    trace_new_coarse(shared, fh);
}

/// Promote a frame to a keyframe: insert into the window, wire
/// residuals, activate points, optimise, marginalise, seed new immature
/// points.
pub(crate) fn make_keyframe(shared: &Arc<SystemShared>, fh: &TrackedFrame) {
    {
        let mut frames = shared.frames.lock();
        frames.compose_from_ref(fh.frame);
    }
    trace_new_coarse(shared, fh);

    let settings = &shared.settings;
    let calib = &shared.calib;
    let mut map = shared.map.lock();
    let map = &mut *map;

    map.window.flag_keyframes_for_marginalization(settings);

    let (cam_to_world, aff, exposure) = {
        let frames = shared.frames.lock();
        let shell = frames.get(fh.frame);
        (shell.cam_to_world.clone(), shell.aff_g2l, shell.exposure)
    };
    let kf_id = map
        .window
        .push_keyframe(fh.frame, fh.pyramid.clone(), exposure, cam_to_world, aff);
    {
        let mut frames = shared.frames.lock();
        frames.get_mut(fh.frame).keyframe_id = Some(kf_id.0);
    }
    shared.keyframe_history.lock().push(fh.frame);
    map.backend.insert_frame(kf_id);

    map.window.set_precalc_values(calib);
    map.backend.set_delta(calib);

    map.window.add_residuals_for_new_keyframe(map.backend.as_mut());

    map.activator.activate_points(
        &mut map.window,
        map.backend.as_mut(),
        &mut map.dmap,
        calib,
        settings,
        &map.pool,
    );
    map.backend.make_index(&map.window);

    let rmse = map
        .backend
        .optimize(settings.max_opt_iterations, &mut map.window, calib, settings);

    // Tiered initialisation-failure thresholds over the first keyframes.
    let n_kfs = shared.keyframe_history.lock().len();
    let slack = settings.benchmark_initializer_slack_factor;
    let failed = (n_kfs == 2 && rmse > 20.0 * slack)
        || (n_kfs == 3 && rmse > 13.0 * slack)
        || (n_kfs == 4 && rmse > 9.0 * slack);
    if failed {
        warn!(rmse, keyframes = n_kfs, "initialisation looks bad; resetting");
        shared.init_failed.store(true, Ordering::SeqCst);
    }

    // Remove outliers: points that lost all their residuals.
    for kf in map.window.keyframes_mut() {
        for p in &mut kf.active_points {
            if p.residuals.is_empty() {
                p.status = crate::point::PointStatus::Drop;
            }
        }
    }
    map.backend.drop_points(&mut map.window);

    {
        let mut imu = shared.imu.lock();
        imu.finish_keyframe_optimization(fh.frame);
        shared.trackers.prepare_for_new_keyframe(&map.window, calib);
    }

    map.window.flag_points_for_removal(calib, settings);
    map.backend.drop_points(&mut map.window);
    map.backend.marginalize_points(&mut map.window);

    make_new_points(map, calib, settings);

    {
        let mut frames = shared.frames.lock();
        while let Some(victim) = map.window.any_flagged() {
            map.window
                .marginalize_frame(victim, &mut frames, calib, map.backend.as_mut());
        }
        // Mirror optimised window poses back into the shells.
        for kf in map.window.keyframes() {
            let shell = frames.get_mut(kf.frame);
            shell.cam_to_world = kf.cam_to_world.clone();
            shell.aff_g2l = kf.aff_g2l;
        }
    }

    info!(
        keyframe = %kf_id,
        window = map.window.len(),
        points = map.backend.num_points(),
        rmse,
        "created keyframe"
    );
}

/// Seed new immature points on the newest keyframe from the pixel
/// selector.
fn make_new_points(map: &mut MapState, calib: &Calibration, settings: &Settings) {
    let Some(newest_idx) = map.window.len().checked_sub(1) else {
        return;
    };
    let pyramid = map.window.keyframes()[newest_idx].pyramid.clone();
    let kf_id = map.window.keyframes()[newest_idx].keyframe_id;
    let selected = map.selector.make_maps(
        &pyramid,
        settings.desired_immature_density,
        &mut map.selection_map,
    );

    let w = calib.width(0);
    let h = calib.height(0);
    let pad = PATTERN_PADDING as usize;
    let mut made = 0usize;
    for y in pad + 1..h - pad - 2 {
        for x in pad + 1..w - pad - 2 {
            let score = map.selection_map[x + y * w];
            if score == 0.0 {
                continue;
            }
            if let Some(imm) =
                ImmaturePoint::new(x as f32, y as f32, kf_id, &pyramid, score, settings)
            {
                map.window.keyframes_mut()[newest_idx].immature_points.push(imm);
                made += 1;
            }
        }
    }
    debug!(selected, made, "seeded immature points");
}

/// Trace every immature point of every window keyframe in the new frame.
fn trace_new_coarse(shared: &Arc<SystemShared>, fh: &TrackedFrame) {
    let (fh_world, fh_aff, fh_exposure) = {
        let frames = shared.frames.lock();
        let shell = frames.get(fh.frame);
        (shell.cam_to_world.clone(), shell.aff_g2l, shell.exposure)
    };

    let calib = &shared.calib;
    let k = calib.k(0);
    let ki = calib.k_inv(0);
    let settings = &shared.settings;

    let mut map = shared.map.lock();
    let mut stats = [0usize; 6];
    for kf in map.window.keyframes_mut() {
        let host_to_new = &fh_world.inverse() * &kf.cam_to_world;
        let krki = (k * host_to_new.rotation_matrix() * ki).cast::<f32>();
        let kt = (k * host_to_new.translation).cast::<f32>();
        let aff = AffLight::from_to_vec_exposure(kf.exposure, fh_exposure, kf.aff_g2l, fh_aff);
        let aff = (aff.0 as f32, aff.1 as f32);

        for imm in &mut kf.immature_points {
            let status = imm.trace(&fh.pyramid, &krki, &kt, aff, settings);
            let slot = match status {
                TraceStatus::Good => 0,
                TraceStatus::Skipped => 1,
                TraceStatus::BadCondition => 2,
                TraceStatus::OutOfBounds => 3,
                TraceStatus::Outlier => 4,
                TraceStatus::Uninitialized => 5,
            };
            stats[slot] += 1;
        }
    }
    debug!(
        good = stats[0],
        skipped = stats[1],
        bad_condition = stats[2],
        oob = stats[3],
        outlier = stats[4],
        uninitialized = stats[5],
        frame = %fh.frame,
        "traced immature points"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> Settings {
        let mut settings = Settings::default();
        settings.linearize_operation = true;
        settings.num_threads = 1;
        settings.desired_point_density = 60.0;
        settings.desired_immature_density = 60.0;
        settings
    }

    fn test_calib() -> Calibration {
        Calibration::new(64, 48, 60.0, 60.0, 31.5, 23.5)
    }

    /// Textured scene shifted horizontally by `shift_x` pixels.
    fn texture(shift_x: f32) -> Vec<f32> {
        let mut img = vec![0.0f32; 64 * 48];
        for y in 0..48 {
            for x in 0..64 {
                let xf = x as f32 - shift_x;
                img[x + y * 64] = 100.0
                    + 40.0 * (0.2 * xf).sin()
                    + 30.0 * (0.15 * y as f32).cos()
                    + 0.5 * xf;
            }
        }
        img
    }

    fn feed(system: &mut OdometrySystem, pixels: &[f32], t: f64, id: usize) {
        system
            .process_frame(&ImageInput {
                pixels,
                exposure: 1.0,
                timestamp: t,
                incoming_id: id,
                imu_samples: &[],
            })
            .unwrap();
    }

    #[test]
    fn still_camera_keeps_two_keyframes() {
        let mut system = OdometrySystem::new(test_calib(), test_settings());
        let img = texture(0.0);
        for i in 0..10 {
            feed(&mut system, &img, 0.1 * i as f64, i);
        }

        assert!(system.initialized());
        assert!(!system.is_lost());
        assert_eq!(system.shared().keyframe_history.lock().len(), 2);
        assert_eq!(system.shared().map.lock().window.len(), 2);

        // All post-initialisation frames tracked well and stayed
        // non-keyframes.
        let frames = system.shared().frames.lock();
        for i in 2..10 {
            let shell = frames.get(FrameId(i));
            assert!(shell.tracking_was_good, "frame {i} was not well tracked");
            assert!(shell.keyframe_id.is_none());
        }
    }

    #[test]
    fn translating_camera_creates_keyframes_and_stays_on_axis() {
        let mut system = OdometrySystem::new(test_calib(), test_settings());
        for i in 0..8 {
            let img = texture(1.2 * i as f32);
            feed(&mut system, &img, 0.1 * i as f64, i);
        }

        assert!(system.initialized());
        assert!(!system.is_lost());
        let n_kfs = system.shared().keyframe_history.lock().len();
        assert!(n_kfs > 2, "flow never promoted a keyframe");
        assert!(n_kfs < 8);

        // Pure x-motion (image content drifts +x, so the camera moves
        // -x): the other translation axes stay near zero and x is
        // monotone.
        let frames = system.shared().frames.lock();
        let mut last_x = 0.0f64;
        for i in 2..8 {
            let shell = frames.get(FrameId(i));
            if !shell.pose_valid {
                continue;
            }
            let t = &shell.cam_to_world.translation;
            assert!(t.y.abs() < 0.02, "frame {i}: t_y = {}", t.y);
            assert!(t.z.abs() < 0.02, "frame {i}: t_z = {}", t.z);
            assert!(t.x <= last_x + 0.005, "frame {i}: x went backwards");
            last_x = t.x;
        }
    }

    #[test]
    fn initialization_timeout_requests_full_reset() {
        let mut settings = test_settings();
        settings.max_time_between_init_frames = 2.0;
        // A flat scene never snaps: there is nothing to select or align.
        let mut system = OdometrySystem::new(test_calib(), settings);
        let flat = vec![50.0f32; 64 * 48];

        feed(&mut system, &flat, 0.0, 0);
        assert!(!system.full_reset_requested());
        feed(&mut system, &flat, 1.0, 1);
        assert!(!system.full_reset_requested());
        feed(&mut system, &flat, 3.0, 2);
        assert!(system.full_reset_requested());
        assert!(!system.initialized());
    }

    #[test]
    fn window_stays_bounded_on_long_runs() {
        let mut settings = test_settings();
        settings.max_frames = 4;
        settings.min_frames = 2;
        let mut system = OdometrySystem::new(test_calib(), settings);
        for i in 0..20 {
            let img = texture(1.0 * i as f32);
            feed(&mut system, &img, 0.1 * i as f64, i);
            if system.is_lost() {
                break;
            }
        }
        assert!(system.shared().map.lock().window.len() <= 5);
    }

    #[test]
    fn threaded_pipeline_initialises_and_shuts_down() {
        let mut settings = test_settings();
        settings.linearize_operation = false;
        let mut system = OdometrySystem::new(test_calib(), settings);
        let img = texture(0.0);
        for i in 0..5 {
            feed(&mut system, &img, 0.1 * i as f64, i);
        }
        system.shutdown();
        assert!(system.initialized());
        assert!(system.shared().keyframe_history.lock().len() >= 2);
    }
}

//! Timelapse round loop: visit every active position, fire its triggers,
//! return the stage to rest, write the cached frames and pace the next round.

use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::camera::Camera;
use crate::clock::{Clock, TimeoutWindow};
use crate::error::{AcquisitionError, StageError};
use crate::experiment::ExperimentConfig;
use crate::prior::ProScanController;
use crate::slot::{PositionSlot, position_folder};
use crate::storage::{ImageSink, ensure_folder};
use crate::trigger::{DeviceContext, TriggerSequence};
use crate::types::Position;

/// Every position, the shared trigger sequence and the round cadence.
pub struct AcquisitionPlan {
    slots: Vec<PositionSlot>,
    triggers: TriggerSequence,
    delay: Duration,
}

impl AcquisitionPlan {
    pub fn new(
        positions: &[Position],
        target_rounds: u32,
        delay: Duration,
        data_folder: &Path,
        triggers: TriggerSequence,
    ) -> Result<Self, AcquisitionError> {
        if positions.is_empty() {
            return Err(AcquisitionError::Config(
                "at least one stage position is required".to_string(),
            ));
        }
        if triggers.is_empty() {
            return Err(AcquisitionError::Config(
                "at least one trigger is required".to_string(),
            ));
        }

        let slots = positions
            .iter()
            .enumerate()
            .map(|(id, position)| {
                PositionSlot::new(
                    id,
                    *position,
                    position_folder(data_folder, id),
                    target_rounds,
                )
            })
            .collect();

        Ok(Self {
            slots,
            triggers,
            delay,
        })
    }

    pub fn from_experiment(config: &ExperimentConfig) -> Result<Self, AcquisitionError> {
        Self::new(
            &config.positions,
            config.target_rounds,
            config.delay,
            &config.data_folder,
            config.build_triggers(),
        )
    }

    pub fn slots(&self) -> &[PositionSlot] {
        &self.slots
    }

    pub fn triggers(&self) -> &TriggerSequence {
        &self.triggers
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_active(&self) -> bool {
        self.slots.iter().any(PositionSlot::is_active)
    }

    /// First active position, or the first position once the run is complete.
    pub fn rest_position(&self) -> Position {
        self.slots
            .iter()
            .find(|slot| slot.is_active())
            .unwrap_or(&self.slots[0])
            .position()
    }

    fn active_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_active())
            .map(|(index, _)| index)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Consecutive aborted rounds a position may retry before the run fails.
    pub max_trigger_retries: u32,
    /// Disable the joystick while positions are visited.
    pub joystick_interlock: bool,
    /// Spacing of "time remaining" messages during the cadence wait.
    pub status_interval: Duration,
    /// Longest single sleep while waiting for the next round.
    pub wait_step: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_trigger_retries: 3,
            joystick_interlock: true,
            status_interval: Duration::from_secs(30),
            wait_step: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub rounds: u32,
    pub images_written: usize,
    pub aborted_slot_rounds: u32,
    pub interrupted: bool,
}

pub struct Scheduler {
    stage: ProScanController,
    camera: Box<dyn Camera>,
    sink: Box<dyn ImageSink>,
    plan: AcquisitionPlan,
    clock: Arc<dyn Clock>,
    options: SchedulerOptions,
    shutdown: Arc<AtomicBool>,
    summary: RunSummary,
}

impl Scheduler {
    pub fn new(
        stage: ProScanController,
        camera: Box<dyn Camera>,
        sink: Box<dyn ImageSink>,
        plan: AcquisitionPlan,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            stage,
            camera,
            sink,
            plan,
            clock,
            options: SchedulerOptions::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            summary: RunSummary::default(),
        }
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    /// Flag checked between positions and during the cadence wait.
    pub fn set_shutdown_flag(&mut self, flag: Arc<AtomicBool>) {
        self.shutdown = flag;
    }

    pub fn plan(&self) -> &AcquisitionPlan {
        &self.plan
    }

    pub fn stage(&self) -> &ProScanController {
        &self.stage
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    fn interrupted(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Run rounds until no position is active or the shutdown flag is set.
    ///
    /// On a fatal error the frames already captured are still written, the
    /// stage returns to rest when it is safe to move, and the error is
    /// returned.
    pub fn run(&mut self) -> Result<RunSummary, AcquisitionError> {
        info!("=============================================================");
        info!(" NEW IMAGE ACQUISITION ");
        info!("=============================================================");

        let outcome = self.prepare().and_then(|_| self.run_rounds());
        match outcome {
            Ok(()) => {
                if self.interrupted() {
                    self.summary.interrupted = true;
                    info!("Acquisition stopped by user");
                } else {
                    info!("Acquisition complete");
                }
                log::logger().flush();
                Ok(self.summary.clone())
            }
            Err(e) => {
                error!("Acquisition aborted: {}", e);
                self.recover(&e);
                log::logger().flush();
                Err(e)
            }
        }
    }

    fn prepare(&mut self) -> Result<(), AcquisitionError> {
        for slot in self.plan.slots() {
            info!("Creating position folder {}", slot.output_dir().display());
            ensure_folder(slot.output_dir())?;
        }

        let mut devices = DeviceContext {
            stage: &mut self.stage,
            camera: self.camera.as_mut(),
        };
        self.plan
            .triggers
            .initialize(&mut devices)
            .map_err(AcquisitionError::TriggerSetup)
    }

    fn run_rounds(&mut self) -> Result<(), AcquisitionError> {
        while self.plan.is_active() && !self.interrupted() {
            let window = TimeoutWindow::start(self.clock.clone(), self.plan.delay);
            self.run_round()?;
            if self.plan.is_active() {
                self.wait_for_cadence(&window);
            }
        }
        Ok(())
    }

    fn run_round(&mut self) -> Result<(), AcquisitionError> {
        let active = self.plan.active_slots();
        info!(
            "Acquiring image set {} ({} of {} positions active)",
            self.summary.rounds,
            active.len(),
            self.plan.slots.len()
        );

        if self.options.joystick_interlock {
            self.set_joystick(false)?;
        }

        for index in active {
            if self.interrupted() {
                warn!("Shutdown requested, skipping remaining positions");
                break;
            }
            self.visit(index)?;
        }

        let rest = self.plan.rest_position();
        self.stage.goto(rest)?;
        if self.options.joystick_interlock {
            self.set_joystick(true)?;
        }

        self.flush_caches()?;
        self.summary.rounds += 1;
        Ok(())
    }

    fn visit(&mut self, index: usize) -> Result<(), AcquisitionError> {
        let Self {
            stage,
            camera,
            plan,
            options,
            summary,
            ..
        } = self;
        let AcquisitionPlan {
            slots, triggers, ..
        } = plan;
        let slot = &mut slots[index];

        stage.goto(slot.position())?;

        let mut devices = DeviceContext {
            stage,
            camera: camera.as_mut(),
        };
        for trigger_index in 0..triggers.len() {
            let name = triggers.name(trigger_index).to_string();
            info!(" - Acquiring {} image...", name);

            match triggers.fire(trigger_index, &mut devices) {
                Ok(image) => {
                    slot.cache_frame(trigger_index, image);
                }
                Err(source) => {
                    let attempts = slot.abort_round(trigger_index);
                    if source.is_fatal() {
                        return Err(AcquisitionError::Trigger {
                            slot: slot.id(),
                            trigger: name,
                            source,
                        });
                    }
                    if attempts > options.max_trigger_retries {
                        return Err(AcquisitionError::TriggerRetriesExhausted {
                            slot: slot.id(),
                            trigger: name,
                            attempts,
                            source,
                        });
                    }
                    warn!(
                        "Position {}: trigger '{}' failed ({}), round {} will be retried",
                        slot.id(),
                        name,
                        source,
                        slot.rounds_done()
                    );
                    summary.aborted_slot_rounds += 1;
                    return Ok(());
                }
            }
        }

        slot.complete_round();
        Ok(())
    }

    fn set_joystick(&mut self, enabled: bool) -> Result<(), StageError> {
        let result = if enabled {
            self.stage.enable_joystick()
        } else {
            self.stage.disable_joystick()
        };
        match result {
            Err(e) if e.is_recoverable() => {
                warn!("Continuing without joystick interlock: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    /// Write every cached frame. A failed write does not stop the others;
    /// the first failure is returned once all frames were attempted.
    fn flush_caches(&mut self) -> Result<(), AcquisitionError> {
        info!("Writing images to disk from cache...");
        let mut first_error = None;
        for slot in &mut self.plan.slots {
            for (path, image) in slot.drain_cache() {
                info!(" - {}", path.display());
                match self.sink.write(&path, &image) {
                    Ok(()) => self.summary.images_written += 1,
                    Err(e) => {
                        error!("{}", e);
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn wait_for_cadence(&self, window: &TimeoutWindow) {
        let interval = self.options.status_interval.as_secs().max(1);
        let mut last_report = None;

        while window.active() {
            if self.interrupted() {
                info!("Shutdown requested during cadence wait");
                return;
            }
            let remaining = window.remaining();
            let bucket = remaining.as_secs() / interval;
            if last_report != Some(bucket) {
                info!("Time remaining: {}s", remaining.as_secs());
                last_report = Some(bucket);
            }
            self.clock.sleep(remaining.min(self.options.wait_step));
        }
    }

    /// Best-effort cleanup after a fatal error.
    fn recover(&mut self, cause: &AcquisitionError) {
        if let Err(e) = self.flush_caches() {
            error!("Could not write cached images: {}", e);
        }

        let link_lost = matches!(
            cause,
            AcquisitionError::Stage(StageError::Transport { .. })
                | AcquisitionError::Trigger { .. }
        );
        if link_lost || self.stage.is_faulted() {
            warn!("Stage left in place; check it before moving by hand");
            return;
        }

        let rest = self.plan.rest_position();
        if let Err(e) = self.stage.goto(rest) {
            error!("Could not return stage to rest: {}", e);
            return;
        }
        if let Err(e) = self.stage.enable_joystick() {
            error!("Could not re-enable joystick: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SyntheticCamera;
    use crate::clock::ManualClock;
    use crate::error::{CameraError, StorageError, TriggerError};
    use crate::prior::{CommandChannel, SimulatedProScan, SimulatorHandle};
    use crate::trigger::{LightSourceTrigger, Trigger};
    use image::DynamicImage;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    #[derive(Clone, Default)]
    struct MemorySink {
        written: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl ImageSink for MemorySink {
        fn write(&mut self, path: &Path, _image: &DynamicImage) -> Result<(), StorageError> {
            self.written.lock().push(path.to_path_buf());
            Ok(())
        }
    }

    impl MemorySink {
        fn names(&self) -> Vec<String> {
            self.written
                .lock()
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect()
        }
    }

    /// Records every attempt and rejects the first one.
    #[derive(Clone, Default)]
    struct FailFirstSink {
        attempts: Arc<Mutex<Vec<PathBuf>>>,
    }

    impl ImageSink for FailFirstSink {
        fn write(&mut self, path: &Path, _image: &DynamicImage) -> Result<(), StorageError> {
            let mut attempts = self.attempts.lock();
            attempts.push(path.to_path_buf());
            if attempts.len() == 1 {
                return Err(StorageError::Folder {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
                });
            }
            Ok(())
        }
    }

    /// Fails the first `failures` invocations.
    struct FlakyTrigger {
        failures: u32,
    }

    impl Trigger for FlakyTrigger {
        fn name(&self) -> &str {
            "flaky"
        }
        fn initialize(&mut self, _devices: &mut DeviceContext<'_>) -> Result<(), TriggerError> {
            Ok(())
        }
        fn fire(&mut self, devices: &mut DeviceContext<'_>) -> Result<DynamicImage, TriggerError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(CameraError::Capture("frame dropped".into()).into());
            }
            Ok(devices.camera.snap()?)
        }
    }

    struct Harness {
        scheduler: Scheduler,
        device: SimulatorHandle,
        sink: MemorySink,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
    }

    fn harness(
        positions: &[Position],
        rounds: u32,
        delay: Duration,
        triggers: TriggerSequence,
    ) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let (device, handle) = SimulatedProScan::new();
        let stage = ProScanController::builder()
            .clock(clock.clone())
            .connect(CommandChannel::new(device))
            .unwrap();
        handle.clear_history();

        let dir = tempfile::tempdir().unwrap();
        let plan = AcquisitionPlan::new(positions, rounds, delay, dir.path(), triggers).unwrap();
        let sink = MemorySink::default();
        let scheduler = Scheduler::new(
            stage,
            Box::new(SyntheticCamera::new(4, 4)),
            Box::new(sink.clone()),
            plan,
            clock.clone(),
        );
        Harness {
            scheduler,
            device: handle,
            sink,
            clock,
            _dir: dir,
        }
    }

    fn two_channels() -> TriggerSequence {
        let mut triggers = TriggerSequence::default();
        triggers.push(LightSourceTrigger::new("brightfield", None, None));
        triggers.push(LightSourceTrigger::new("GFP", Some(1), None));
        triggers
    }

    fn positions(n: i64) -> Vec<Position> {
        (0..n).map(|i| Position::new(i * 1000, i * 500, 10)).collect()
    }

    #[test]
    fn test_plan_rejects_empty_inputs() {
        let dir = Path::new("data");
        assert!(AcquisitionPlan::new(&[], 1, Duration::ZERO, dir, two_channels()).is_err());
        assert!(
            AcquisitionPlan::new(&positions(1), 1, Duration::ZERO, dir, TriggerSequence::default())
                .is_err()
        );
    }

    #[test]
    fn test_every_slot_runs_exactly_k_rounds() {
        let mut h = harness(&positions(3), 4, Duration::ZERO, two_channels());

        let summary = h.scheduler.run().unwrap();

        assert_eq!(summary.rounds, 4);
        assert_eq!(summary.images_written, 3 * 4 * 2);
        assert!(!h.scheduler.plan().is_active());
        for slot in h.scheduler.plan().slots() {
            assert_eq!(slot.rounds_done(), 4);
            assert_eq!(slot.cached(), 0);
        }
    }

    #[test]
    fn test_frames_written_every_round() {
        let mut h = harness(&positions(2), 2, Duration::ZERO, two_channels());
        h.scheduler.run().unwrap();

        assert_eq!(
            h.sink.names(),
            vec![
                "img_channel000_position000_time000000000_z000.tif",
                "img_channel001_position000_time000000000_z000.tif",
                "img_channel000_position001_time000000000_z000.tif",
                "img_channel001_position001_time000000000_z000.tif",
                "img_channel000_position000_time000000001_z000.tif",
                "img_channel001_position000_time000000001_z000.tif",
                "img_channel000_position001_time000000001_z000.tif",
                "img_channel001_position001_time000000001_z000.tif",
            ]
        );
    }

    #[test]
    fn test_round_visits_positions_then_rests() {
        let mut h = harness(&positions(2), 1, Duration::ZERO, two_channels());
        h.scheduler.run().unwrap();

        assert_eq!(
            h.device.moves(),
            vec!["G 0, 0, 10", "G 1000, 500, 10", "G 0, 0, 10"]
        );
        assert_eq!(h.device.position(), Position::new(0, 0, 10));

        let commands = h.device.commands();
        let disable = commands.iter().position(|c| c == "H").unwrap();
        let first_move = commands.iter().position(|c| c.starts_with("G ")).unwrap();
        assert!(disable < first_move);
        assert_eq!(commands.last().map(String::as_str), Some("J"));
    }

    #[test]
    fn test_cadence_paces_round_starts() {
        let delay = Duration::from_secs(240);
        let mut h = harness(&positions(2), 3, delay, two_channels());

        h.scheduler.run().unwrap();

        let elapsed = h.clock.elapsed();
        assert!(elapsed >= delay * 2, "elapsed {elapsed:?}");
        assert!(elapsed < delay * 3, "no wait after the final round");
    }

    #[test]
    fn test_failed_trigger_retries_round_without_counting() {
        let mut triggers = TriggerSequence::default();
        triggers.push(LightSourceTrigger::new("brightfield", None, None));
        triggers.push(FlakyTrigger { failures: 1 });
        let mut h = harness(&positions(1), 2, Duration::ZERO, triggers);

        let summary = h.scheduler.run().unwrap();

        assert_eq!(summary.aborted_slot_rounds, 1);
        assert_eq!(summary.rounds, 3);
        assert_eq!(summary.images_written, 4);
        // no partial frame of the aborted round was written
        assert_eq!(
            h.sink.names(),
            vec![
                "img_channel000_position000_time000000000_z000.tif",
                "img_channel001_position000_time000000000_z000.tif",
                "img_channel000_position000_time000000001_z000.tif",
                "img_channel001_position000_time000000001_z000.tif",
            ]
        );
    }

    #[test]
    fn test_retries_exhausted_aborts_run() {
        let mut triggers = TriggerSequence::default();
        triggers.push(FlakyTrigger { failures: u32::MAX });
        let mut h = harness(&positions(2), 1, Duration::ZERO, triggers);

        let err = h.scheduler.run().unwrap_err();
        match err {
            AcquisitionError::TriggerRetriesExhausted { slot, attempts, .. } => {
                assert_eq!(slot, 0);
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_motion_timeout_stops_run_and_keeps_frames() {
        let mut h = harness(&positions(2), 2, Duration::ZERO, two_channels());
        // first position settles, the second never does
        h.device
            .script_status(["0", "0", "0"].into_iter().chain(std::iter::repeat_n("3", 100)));

        let err = h.scheduler.run().unwrap_err();
        assert!(matches!(
            err,
            AcquisitionError::Stage(StageError::MotionTimeout { .. })
        ));
        assert!(h.scheduler.stage().is_faulted());
        // frames from the first position were still written
        assert_eq!(h.sink.names().len(), 2);
        assert_eq!(h.device.moves().len(), 2);
    }

    #[test]
    fn test_failed_write_keeps_remaining_frames() {
        let mut triggers = TriggerSequence::default();
        for name in ["brightfield", "GFP", "RFP"] {
            triggers.push(LightSourceTrigger::new(name, None, None));
        }
        let mut h = harness(&positions(1), 2, Duration::ZERO, triggers);
        let sink = FailFirstSink::default();
        h.scheduler.sink = Box::new(sink.clone());

        let err = h.scheduler.run().unwrap_err();

        assert!(matches!(err, AcquisitionError::Storage(_)));
        let attempted: Vec<String> = sink
            .attempts
            .lock()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            attempted,
            vec![
                "img_channel000_position000_time000000000_z000.tif",
                "img_channel001_position000_time000000000_z000.tif",
                "img_channel002_position000_time000000000_z000.tif",
            ]
        );
        assert_eq!(h.scheduler.summary().images_written, 2);
        assert_eq!(h.scheduler.plan().slots()[0].cached(), 0);
    }

    #[test]
    fn test_shutdown_flag_stops_before_first_round() {
        let mut h = harness(&positions(2), 5, Duration::from_secs(60), two_channels());
        let flag = Arc::new(AtomicBool::new(true));
        h.scheduler.set_shutdown_flag(flag);

        let summary = h.scheduler.run().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.rounds, 0);
        assert!(h.device.moves().is_empty());
    }

    #[test]
    fn test_joystick_nack_does_not_stop_run() {
        let mut h = harness(&positions(1), 1, Duration::ZERO, two_channels());
        h.device.reject("H");
        h.device.reject("J");

        let summary = h.scheduler.run().unwrap();
        assert_eq!(summary.images_written, 2);
    }

    #[test]
    fn test_zero_rounds_does_nothing() {
        let mut h = harness(&positions(2), 0, Duration::from_secs(10), two_channels());
        let summary = h.scheduler.run().unwrap();
        assert_eq!(summary, RunSummary::default());
        assert_eq!(h.scheduler.plan().rest_position(), Position::new(0, 0, 10));
    }
}

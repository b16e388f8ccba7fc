pub mod camera;
pub mod clock;
pub mod config;
pub mod error;
pub mod experiment;
pub mod logger;
pub mod prior;
pub mod scheduler;
pub mod slot;
pub mod storage;
pub mod trigger;
pub mod types;
pub mod utils;

pub use camera::{Camera, SyntheticCamera};
pub use clock::{Clock, ManualClock, SystemClock, TimeoutWindow};
pub use config::{AppConfig, load_config};
pub use error::{
    AcquisitionError, CameraError, ExperimentError, StageError, StorageError, TriggerError,
};
pub use experiment::{ExperimentConfig, ExperimentParams, TriggerSpec};
pub use prior::{
    AxisConfig, CommandChannel, MotionState, ProScanBuilder, ProScanController, SerialSettings,
    SerialTransport, SimulatedProScan, SimulatorHandle, Transport,
};
pub use scheduler::{AcquisitionPlan, RunSummary, Scheduler, SchedulerOptions};
pub use slot::PositionSlot;
pub use storage::{ImageSink, TiffSink};
pub use trigger::{DeviceContext, LightSourceTrigger, Trigger, TriggerSequence};
pub use types::{BusyMask, Position, StageAxis};

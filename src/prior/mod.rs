pub mod axis;
pub mod channel;
pub mod controller;
pub mod protocol;
pub mod simulator;

pub use axis::{AxisConfig, AxisParameter};
pub use channel::{CommandChannel, SerialSettings, SerialTransport, Transport};
pub use controller::{MotionState, ProScanBuilder, ProScanController};
pub use simulator::{SimulatedProScan, SimulatorHandle};

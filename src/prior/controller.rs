use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;

use super::axis::AxisConfig;
use super::channel::CommandChannel;
use super::protocol::{self, DEFAULT_ACK, TTL_PIN_COUNT};
use crate::clock::{Clock, SystemClock};
use crate::error::StageError;
use crate::types::{BusyMask, Position, StageAxis};
use crate::utils::{PollError, poll_until};

/// Where a move is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Idle,
    Commanded,
    Busy,
    /// A move never completed; the stage position is unknown.
    TimedOut,
}

/// Builder for [`ProScanController`].
///
/// ```
/// use std::time::Duration;
/// use stage_timelapse::prior::{AxisConfig, CommandChannel, ProScanController, SimulatedProScan};
///
/// let (device, _handle) = SimulatedProScan::new();
/// let controller = ProScanController::builder()
///     .move_timeout(Duration::from_secs(10))
///     .axis(AxisConfig::h117ex())
///     .connect(CommandChannel::new(device))?;
/// # Ok::<(), stage_timelapse::StageError>(())
/// ```
pub struct ProScanBuilder {
    ack: String,
    move_timeout: Duration,
    poll_interval: Duration,
    settle_reads: u32,
    clock: Arc<dyn Clock>,
    axes: Vec<AxisConfig>,
}

impl Default for ProScanBuilder {
    fn default() -> Self {
        Self {
            ack: DEFAULT_ACK.to_string(),
            move_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            settle_reads: 3,
            clock: Arc::new(SystemClock),
            axes: Vec::new(),
        }
    }
}

impl ProScanBuilder {
    /// Reply the device sends for an accepted command.
    pub fn ack(mut self, ack: &str) -> Self {
        self.ack = ack.to_string();
        self
    }

    pub fn move_timeout(mut self, timeout: Duration) -> Self {
        self.move_timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Consecutive idle status reads that end a move.
    pub fn settle_reads(mut self, reads: u32) -> Self {
        self.settle_reads = reads;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn axis(mut self, config: AxisConfig) -> Self {
        self.axes.push(config);
        self
    }

    pub fn axes(mut self, configs: impl IntoIterator<Item = AxisConfig>) -> Self {
        self.axes.extend(configs);
        self
    }

    /// Validate the configuration, run the mode handshake, apply every axis
    /// configuration and drive all TTL outputs low.
    pub fn connect(self, channel: CommandChannel) -> Result<ProScanController, StageError> {
        if self.settle_reads == 0 {
            return Err(StageError::InvalidParameter(
                "settle_reads must be at least 1".to_string(),
            ));
        }
        for config in &self.axes {
            config.validate()?;
        }

        let mut controller = ProScanController {
            channel,
            ack: self.ack,
            move_timeout: self.move_timeout,
            poll_interval: self.poll_interval,
            settle_reads: self.settle_reads,
            clock: self.clock,
            state: MotionState::Idle,
            axes: Vec::new(),
        };

        controller.select_standard_mode()?;
        for config in self.axes {
            controller.apply_axis(&config)?;
            controller.axes.push(config);
        }
        for pin in 0..TTL_PIN_COUNT {
            controller.pulse(pin, false)?;
        }

        info!("ProScan controller ready");
        Ok(controller)
    }
}

/// Prior ProScan III stage and TTL controller.
pub struct ProScanController {
    channel: CommandChannel,
    ack: String,
    move_timeout: Duration,
    poll_interval: Duration,
    settle_reads: u32,
    clock: Arc<dyn Clock>,
    state: MotionState,
    axes: Vec<AxisConfig>,
}

impl ProScanController {
    pub fn builder() -> ProScanBuilder {
        ProScanBuilder::default()
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn is_faulted(&self) -> bool {
        self.state == MotionState::TimedOut
    }

    pub fn axes(&self) -> &[AxisConfig] {
        &self.axes
    }

    pub fn move_timeout(&self) -> Duration {
        self.move_timeout
    }

    fn select_standard_mode(&mut self) -> Result<(), StageError> {
        let reply = self.channel.send_and_receive(protocol::STANDARD_MODE)?;
        if reply != self.ack {
            error!("ProScan controller is not in Standard mode");
            return Err(StageError::Initialization {
                expected: self.ack.clone(),
                actual: reply,
            });
        }
        Ok(())
    }

    fn apply_axis(&mut self, config: &AxisConfig) -> Result<(), StageError> {
        info!("Setting stage parameters for {}", config.name);
        for (parameter, command) in config.commands() {
            info!("{} -> {}", parameter.name(), command);
            let reply = self.channel.send_and_receive(&command)?;
            if reply != self.ack {
                error!("Command: {} failed.", command);
                return Err(StageError::Configuration {
                    axis: config.axis,
                    parameter: parameter.name(),
                    command,
                    response: reply,
                });
            }
        }
        Ok(())
    }

    /// Move to an absolute position and block until the stage settles or the
    /// default move timeout expires.
    pub fn goto(&mut self, position: Position) -> Result<(), StageError> {
        self.goto_within(position, self.move_timeout)
    }

    pub fn goto_within(&mut self, position: Position, timeout: Duration) -> Result<(), StageError> {
        if self.is_faulted() {
            return Err(StageError::MotionFault(format!(
                "refusing move to ({position}) after an earlier move timed out"
            )));
        }

        info!("Sending stage to position: {}", position);
        self.state = MotionState::Commanded;
        let command = protocol::goto(&position);
        let reply = self.channel.send_and_receive(&command)?;
        if reply != self.ack {
            self.state = MotionState::Idle;
            return Err(StageError::Protocol(format!(
                "Move `{command}` rejected with {reply:?}"
            )));
        }

        self.state = MotionState::Busy;
        let settle_reads = self.settle_reads;
        let interval = self.poll_interval;
        let clock = self.clock.clone();
        let mut idle_reads = 0u32;

        let result = poll_until(
            clock,
            || {
                if self.busy()? {
                    idle_reads = 0;
                } else {
                    idle_reads += 1;
                }
                Ok::<bool, StageError>(idle_reads >= settle_reads)
            },
            timeout,
            interval,
        );

        match result {
            Ok(()) => {
                self.state = MotionState::Idle;
                Ok(())
            }
            Err(PollError::Timeout(elapsed)) => {
                self.state = MotionState::TimedOut;
                error!("Stage move timed out. Exiting");
                Err(StageError::MotionTimeout {
                    target: position,
                    elapsed,
                })
            }
            Err(PollError::ConditionError(e)) => Err(e),
        }
    }

    /// Query whether any axis is still moving.
    pub fn busy(&mut self) -> Result<bool, StageError> {
        let reply = self.channel.send_and_receive(protocol::STATUS)?;
        let status = protocol::parse_status(&reply)?;
        if status == 0 {
            return Ok(false);
        }

        for axis in BusyMask::from_status(status).moving_axes() {
            debug!("Stage axis {} is still moving...", axis);
        }
        Ok(true)
    }

    /// Set a TTL output. No acknowledgement is awaited.
    pub fn pulse(&mut self, pin: u8, active: bool) -> Result<(), StageError> {
        if pin >= TTL_PIN_COUNT {
            return Err(StageError::InvalidParameter(format!(
                "TTL pin must be in [0, {TTL_PIN_COUNT}), got {pin}"
            )));
        }
        self.channel.send(&protocol::ttl(pin, active))?;
        self.channel.flush()
    }

    pub fn enable_joystick(&mut self) -> Result<(), StageError> {
        self.joystick(protocol::JOYSTICK_ENABLE, "enable")
    }

    pub fn disable_joystick(&mut self) -> Result<(), StageError> {
        self.joystick(protocol::JOYSTICK_DISABLE, "disable")
    }

    fn joystick(&mut self, command: &str, action: &str) -> Result<(), StageError> {
        let reply = self.channel.send_and_receive(command)?;
        if reply != self.ack {
            error!("Joystick {} failed.", action);
            return Err(StageError::Joystick {
                command: command.to_string(),
                response: reply,
            });
        }
        Ok(())
    }

    pub fn position(&mut self) -> Result<Position, StageError> {
        let reply = self.channel.send_and_receive(protocol::POSITION)?;
        protocol::parse_position(&reply)
    }

    pub fn resolution(&mut self, axis: StageAxis) -> Result<f64, StageError> {
        let reply = self.channel.send_and_receive(&protocol::resolution(axis))?;
        let resolution = protocol::parse_resolution(&reply)?;
        info!("Stage axis {} resolution: {}", axis, resolution);
        Ok(resolution)
    }
}

use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::types::StageAxis;

/// Settable axis parameters, in the order they are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisParameter {
    MaxSpeed,
    Acceleration,
    SCurve,
    Encoder,
    EncoderWindow,
    Servo,
    Backlash,
}

impl AxisParameter {
    pub fn name(self) -> &'static str {
        match self {
            AxisParameter::MaxSpeed => "max_speed",
            AxisParameter::Acceleration => "acceleration",
            AxisParameter::SCurve => "s_curve",
            AxisParameter::Encoder => "encoder",
            AxisParameter::EncoderWindow => "encoder_window",
            AxisParameter::Servo => "servo",
            AxisParameter::Backlash => "backlash",
        }
    }
}

/// Parameters each configurable axis accepts.
pub fn capabilities(axis: StageAxis) -> &'static [AxisParameter] {
    use AxisParameter::*;
    match axis {
        StageAxis::S => &[MaxSpeed, Acceleration, SCurve, Encoder, Backlash],
        StageAxis::Z => &[
            MaxSpeed,
            Acceleration,
            SCurve,
            Encoder,
            EncoderWindow,
            Servo,
            Backlash,
        ],
        StageAxis::X | StageAxis::Y => &[],
    }
}

/// Named configuration bound to one axis when the controller is built.
///
/// Unset fields are left at the controller's current value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisConfig {
    pub axis: StageAxis,
    pub name: String,
    #[serde(default)]
    pub max_speed: Option<u8>,
    #[serde(default)]
    pub acceleration: Option<u8>,
    #[serde(default)]
    pub s_curve: Option<u8>,
    #[serde(default)]
    pub encoder: Option<bool>,
    #[serde(default)]
    pub encoder_window: Option<f32>,
    #[serde(default)]
    pub servo: Option<bool>,
    #[serde(default)]
    pub backlash: Option<bool>,
}

impl AxisConfig {
    pub fn new(axis: StageAxis, name: impl Into<String>) -> Self {
        Self {
            axis,
            name: name.into(),
            max_speed: None,
            acceleration: None,
            s_curve: None,
            encoder: None,
            encoder_window: None,
            servo: None,
            backlash: None,
        }
    }

    /// H117EX motorised XY stage.
    pub fn h117ex() -> Self {
        Self {
            max_speed: Some(100),
            acceleration: Some(100),
            s_curve: Some(100),
            encoder: Some(true),
            ..Self::new(StageAxis::S, "H117EX XY Stage")
        }
    }

    /// FB203E focus drive.
    pub fn fb203e() -> Self {
        Self {
            max_speed: Some(100),
            acceleration: Some(100),
            s_curve: Some(100),
            encoder: Some(true),
            servo: Some(true),
            backlash: Some(false),
            ..Self::new(StageAxis::Z, "FB203E Z Stage")
        }
    }

    fn is_set(&self, parameter: AxisParameter) -> bool {
        match parameter {
            AxisParameter::MaxSpeed => self.max_speed.is_some(),
            AxisParameter::Acceleration => self.acceleration.is_some(),
            AxisParameter::SCurve => self.s_curve.is_some(),
            AxisParameter::Encoder => self.encoder.is_some(),
            AxisParameter::EncoderWindow => self.encoder_window.is_some(),
            AxisParameter::Servo => self.servo.is_some(),
            AxisParameter::Backlash => self.backlash.is_some(),
        }
    }

    /// Check ranges and capabilities. Nothing is sent to the controller.
    pub fn validate(&self) -> Result<(), StageError> {
        let supported = capabilities(self.axis);
        if let Some(parameter) = ALL_PARAMETERS
            .iter()
            .find(|p| self.is_set(**p) && !supported.contains(*p))
        {
            return Err(StageError::InvalidParameter(format!(
                "{} ({}) does not support {}",
                self.name,
                self.axis,
                parameter.name()
            )));
        }

        for (parameter, value) in [
            (AxisParameter::MaxSpeed, self.max_speed),
            (AxisParameter::Acceleration, self.acceleration),
            (AxisParameter::SCurve, self.s_curve),
        ] {
            if let Some(v) = value {
                if v == 0 || v > 100 {
                    return Err(StageError::InvalidParameter(format!(
                        "{} {} must be in (0, 100], got {}",
                        self.name,
                        parameter.name(),
                        v
                    )));
                }
            }
        }

        if let Some(window) = self.encoder_window {
            if !(window > 1.0 && window <= 2.0) {
                return Err(StageError::InvalidParameter(format!(
                    "{} encoder_window must be in (1, 2], got {}",
                    self.name, window
                )));
            }
        }

        Ok(())
    }

    /// Set commands for every configured parameter, in application order.
    pub fn commands(&self) -> Vec<(AxisParameter, String)> {
        let axis = self.axis;
        let mut commands = Vec::new();
        if let Some(v) = self.max_speed {
            commands.push((AxisParameter::MaxSpeed, format!("SM{axis}, {v}")));
        }
        if let Some(v) = self.acceleration {
            commands.push((AxisParameter::Acceleration, format!("SA{axis}, {v}")));
        }
        if let Some(v) = self.s_curve {
            commands.push((AxisParameter::SCurve, format!("SC{axis}, {v}")));
        }
        if let Some(v) = self.encoder {
            commands.push((AxisParameter::Encoder, format!("ENCODER {axis}, {}", u8::from(v))));
        }
        if let Some(v) = self.encoder_window {
            commands.push((AxisParameter::EncoderWindow, format!("ENCW {axis}, {v}")));
        }
        if let Some(v) = self.servo {
            commands.push((AxisParameter::Servo, format!("SERVO {axis}, {}", u8::from(v))));
        }
        if let Some(v) = self.backlash {
            commands.push((AxisParameter::Backlash, format!("BL{axis}H, {}", u8::from(v))));
        }
        commands
    }
}

const ALL_PARAMETERS: [AxisParameter; 7] = [
    AxisParameter::MaxSpeed,
    AxisParameter::Acceleration,
    AxisParameter::SCurve,
    AxisParameter::Encoder,
    AxisParameter::EncoderWindow,
    AxisParameter::Servo,
    AxisParameter::Backlash,
];

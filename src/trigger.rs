use image::DynamicImage;
use log::{debug, info};
use std::time::Duration;

use crate::camera::Camera;
use crate::error::TriggerError;
use crate::prior::ProScanController;
use crate::prior::protocol::TTL_PIN_COUNT;

/// Devices a trigger may drive for the duration of one call.
pub struct DeviceContext<'a> {
    pub stage: &'a mut ProScanController,
    pub camera: &'a mut dyn Camera,
}

/// One named capture operation, run once per position per round.
pub trait Trigger: Send {
    fn name(&self) -> &str;

    /// Bind to the devices before the first round.
    fn initialize(&mut self, devices: &mut DeviceContext<'_>) -> Result<(), TriggerError>;

    /// Capture exactly one image.
    fn fire(&mut self, devices: &mut DeviceContext<'_>) -> Result<DynamicImage, TriggerError>;
}

/// Exposure with an optional light source gated by a controller TTL output.
#[derive(Debug, Clone)]
pub struct LightSourceTrigger {
    name: String,
    ttl_pin: Option<u8>,
    exposure: Option<Duration>,
    initialized: bool,
}

impl LightSourceTrigger {
    pub fn new(name: impl Into<String>, ttl_pin: Option<u8>, exposure: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            ttl_pin,
            exposure,
            initialized: false,
        }
    }

    pub fn ttl_pin(&self) -> Option<u8> {
        self.ttl_pin
    }
}

impl Trigger for LightSourceTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, devices: &mut DeviceContext<'_>) -> Result<(), TriggerError> {
        if let Some(pin) = self.ttl_pin {
            if pin >= TTL_PIN_COUNT {
                return Err(TriggerError::Invalid(format!(
                    "{}: TTL pin {} out of range",
                    self.name, pin
                )));
            }
            devices.stage.pulse(pin, false)?;
        }
        self.initialized = true;
        Ok(())
    }

    fn fire(&mut self, devices: &mut DeviceContext<'_>) -> Result<DynamicImage, TriggerError> {
        if !self.initialized {
            return Err(TriggerError::Invalid(format!(
                "{} fired before initialization",
                self.name
            )));
        }
        if let Some(exposure) = self.exposure {
            devices.camera.set_exposure(exposure)?;
        }

        if let Some(pin) = self.ttl_pin {
            devices.stage.pulse(pin, true)?;
        }
        let frame = devices.camera.snap();
        // the light goes off even when the exposure failed
        if let Some(pin) = self.ttl_pin {
            devices.stage.pulse(pin, false)?;
        }
        Ok(frame?)
    }
}

/// Ordered triggers shared by every position.
#[derive(Default)]
pub struct TriggerSequence {
    triggers: Vec<Box<dyn Trigger>>,
}

impl TriggerSequence {
    pub fn new(triggers: Vec<Box<dyn Trigger>>) -> Self {
        Self { triggers }
    }

    pub fn push(&mut self, trigger: impl Trigger + 'static) {
        self.triggers.push(Box::new(trigger));
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.triggers.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn initialize(&mut self, devices: &mut DeviceContext<'_>) -> Result<(), TriggerError> {
        for trigger in &mut self.triggers {
            info!("Initializing trigger: {}", trigger.name());
            trigger.initialize(devices)?;
        }
        Ok(())
    }

    pub fn name(&self, index: usize) -> &str {
        self.triggers.get(index).map(|t| t.name()).unwrap_or("?")
    }

    pub fn fire(
        &mut self,
        index: usize,
        devices: &mut DeviceContext<'_>,
    ) -> Result<DynamicImage, TriggerError> {
        let trigger = self
            .triggers
            .get_mut(index)
            .ok_or_else(|| TriggerError::Invalid(format!("no trigger at index {index}")))?;
        debug!("Firing trigger {}", trigger.name());
        trigger.fire(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SyntheticCamera;
    use crate::error::CameraError;
    use crate::prior::{CommandChannel, SimulatedProScan, SimulatorHandle};

    fn stage() -> (ProScanController, SimulatorHandle) {
        let (device, handle) = SimulatedProScan::new();
        let controller = ProScanController::builder()
            .connect(CommandChannel::new(device))
            .unwrap();
        handle.clear_history();
        (controller, handle)
    }

    struct BrokenCamera;

    impl Camera for BrokenCamera {
        fn name(&self) -> &str {
            "broken"
        }
        fn set_exposure(&mut self, _exposure: Duration) -> Result<(), CameraError> {
            Ok(())
        }
        fn snap(&mut self) -> Result<DynamicImage, CameraError> {
            Err(CameraError::Capture("sensor timeout".into()))
        }
    }

    #[test]
    fn test_light_source_gates_ttl_around_snap() {
        let (mut stage, handle) = stage();
        let mut camera = SyntheticCamera::new(8, 8);
        let mut trigger =
            LightSourceTrigger::new("GFP", Some(1), Some(Duration::from_millis(150)));
        let mut devices = DeviceContext {
            stage: &mut stage,
            camera: &mut camera,
        };

        trigger.initialize(&mut devices).unwrap();
        handle.clear_history();
        let frame = trigger.fire(&mut devices).unwrap();

        assert_eq!(frame.width(), 8);
        assert_eq!(handle.commands(), vec!["TTL 1, 1", "TTL 1, 0"]);
        assert!(!handle.ttl(1));
        assert_eq!(camera.exposure(), Duration::from_millis(150));
    }

    #[test]
    fn test_light_lowered_when_snap_fails() {
        let (mut stage, handle) = stage();
        let mut camera = BrokenCamera;
        let mut trigger = LightSourceTrigger::new("RFP", Some(2), None);
        let mut devices = DeviceContext {
            stage: &mut stage,
            camera: &mut camera,
        };
        trigger.initialize(&mut devices).unwrap();

        let err = trigger.fire(&mut devices).unwrap_err();
        assert!(matches!(err, TriggerError::Camera(_)));
        assert!(!err.is_fatal());
        assert!(!handle.ttl(2));
    }

    #[test]
    fn test_fire_before_initialize() {
        let (mut stage, _handle) = stage();
        let mut camera = SyntheticCamera::new(4, 4);
        let mut trigger = LightSourceTrigger::new("brightfield", None, None);
        let mut devices = DeviceContext {
            stage: &mut stage,
            camera: &mut camera,
        };
        assert!(matches!(
            trigger.fire(&mut devices),
            Err(TriggerError::Invalid(_))
        ));
    }

    #[test]
    fn test_invalid_pin_rejected_at_initialize() {
        let (mut stage, _handle) = stage();
        let mut camera = SyntheticCamera::new(4, 4);
        let mut sequence = TriggerSequence::default();
        sequence.push(LightSourceTrigger::new("bad", Some(7), None));
        let mut devices = DeviceContext {
            stage: &mut stage,
            camera: &mut camera,
        };
        assert!(sequence.initialize(&mut devices).is_err());
    }

    #[test]
    fn test_sequence_fires_by_index() {
        let (mut stage, _handle) = stage();
        let mut camera = SyntheticCamera::new(4, 4);
        let mut sequence = TriggerSequence::default();
        sequence.push(LightSourceTrigger::new("brightfield", None, None));
        sequence.push(LightSourceTrigger::new("GFP", Some(0), None));
        let mut devices = DeviceContext {
            stage: &mut stage,
            camera: &mut camera,
        };

        sequence.initialize(&mut devices).unwrap();
        assert_eq!(sequence.names(), vec!["brightfield", "GFP"]);
        assert!(sequence.fire(1, &mut devices).is_ok());
        assert!(sequence.fire(2, &mut devices).is_err());
    }
}

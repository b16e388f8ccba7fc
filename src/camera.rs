use image::{DynamicImage, GrayImage, Luma};
use std::time::Duration;

use crate::error::CameraError;

/// Image source bound into triggers.
pub trait Camera: Send {
    fn name(&self) -> &str;

    fn set_exposure(&mut self, exposure: Duration) -> Result<(), CameraError>;

    /// Acquire one frame with the current settings.
    fn snap(&mut self) -> Result<DynamicImage, CameraError>;
}

/// Generates 8-bit gradient frames; used for dry runs without a camera.
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    exposure: Duration,
    frames: u64,
}

impl SyntheticCamera {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            exposure: Duration::from_millis(10),
            frames: 0,
        }
    }

    pub fn exposure(&self) -> Duration {
        self.exposure
    }

    pub fn frames_taken(&self) -> u64 {
        self.frames
    }
}

impl Camera for SyntheticCamera {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn set_exposure(&mut self, exposure: Duration) -> Result<(), CameraError> {
        self.exposure = exposure;
        Ok(())
    }

    fn snap(&mut self) -> Result<DynamicImage, CameraError> {
        if self.width == 0 || self.height == 0 {
            return Err(CameraError::NotReady(format!(
                "frame size {}x{} is empty",
                self.width, self.height
            )));
        }
        let offset = (self.frames % 256) as u32;
        let frame = GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([((x + y + offset) % 256) as u8])
        });
        self.frames += 1;
        Ok(DynamicImage::ImageLuma8(frame))
    }
}

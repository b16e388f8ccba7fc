use image::{DynamicImage, ImageFormat};
use log::debug;
use std::fs;
use std::path::Path;

use crate::error::StorageError;

/// Destination for cached frames.
pub trait ImageSink: Send {
    fn write(&mut self, path: &Path, image: &DynamicImage) -> Result<(), StorageError>;
}

/// Writes each frame as an uncompressed TIFF, creating folders on demand.
#[derive(Debug, Default, Clone, Copy)]
pub struct TiffSink;

impl ImageSink for TiffSink {
    fn write(&mut self, path: &Path, image: &DynamicImage) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.is_dir() {
                fs::create_dir_all(parent).map_err(|source| StorageError::Folder {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }
        image
            .save_with_format(path, ImageFormat::Tiff)
            .map_err(|source| StorageError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Wrote {}", path.display());
        Ok(())
    }
}

/// Create `folder` if it does not exist. Returns whether it already existed.
pub fn ensure_folder(folder: &Path) -> Result<bool, StorageError> {
    if folder.is_dir() {
        return Ok(true);
    }
    fs::create_dir_all(folder).map_err(|source| StorageError::Folder {
        path: folder.to_path_buf(),
        source,
    })?;
    Ok(false)
}

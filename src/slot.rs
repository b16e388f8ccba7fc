use image::DynamicImage;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::types::Position;

/// Micro-Manager compatible file name for one frame.
///
/// ```
/// use stage_timelapse::slot::image_filename;
/// assert_eq!(
///     image_filename(2, 1, 0, 0),
///     "img_channel000_position001_time000000002_z000.tif"
/// );
/// ```
pub fn image_filename(round: u32, position: usize, trigger: usize, z: usize) -> String {
    format!("img_channel{trigger:03}_position{position:03}_time{round:09}_z{z:03}.tif")
}

/// Folder holding every frame of one position.
pub fn position_folder(data_folder: &Path, id: usize) -> PathBuf {
    data_folder.join(format!("Pos{id}"))
}

/// Scheduling state of one stage position.
#[derive(Debug)]
pub struct PositionSlot {
    id: usize,
    position: Position,
    output_dir: PathBuf,
    rounds_done: u32,
    target_rounds: u32,
    failed_attempts: u32,
    cache: VecDeque<(PathBuf, DynamicImage)>,
}

impl PositionSlot {
    pub fn new(id: usize, position: Position, output_dir: PathBuf, target_rounds: u32) -> Self {
        Self {
            id,
            position,
            output_dir,
            rounds_done: 0,
            target_rounds,
            failed_attempts: 0,
            cache: VecDeque::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Completed rounds; also the time index of the next round's frames.
    pub fn rounds_done(&self) -> u32 {
        self.rounds_done
    }

    pub fn target_rounds(&self) -> u32 {
        self.target_rounds
    }

    pub fn is_active(&self) -> bool {
        self.rounds_done < self.target_rounds
    }

    /// Consecutive rounds aborted by a trigger failure.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// Queue a frame from the current round and return its destination.
    pub fn cache_frame(&mut self, trigger_index: usize, image: DynamicImage) -> PathBuf {
        let path = self.output_dir.join(image_filename(
            self.rounds_done,
            self.id,
            trigger_index,
            0,
        ));
        self.cache.push_back((path.clone(), image));
        path
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Close the current round after every trigger succeeded.
    pub fn complete_round(&mut self) {
        if self.is_active() {
            self.rounds_done += 1;
        }
        self.failed_attempts = 0;
    }

    /// Drop the current round's frames so the round is retried.
    pub fn abort_round(&mut self, frames_this_round: usize) -> u32 {
        let keep = self.cache.len().saturating_sub(frames_this_round);
        self.cache.truncate(keep);
        self.failed_attempts += 1;
        self.failed_attempts
    }

    /// Take every pending frame in capture order.
    pub fn drain_cache(&mut self) -> impl Iterator<Item = (PathBuf, DynamicImage)> + '_ {
        self.cache.drain(..)
    }
}

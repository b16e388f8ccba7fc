use chrono::{DateTime, Local};
use log::{Level, LevelFilter};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const LOG_FILE_NAME: &str = "acquisition_log.log";

// Tee writer: every formatted record goes to stderr and the acquisition log
struct TeeWriter {
    stderr: io::Stderr,
    file: Option<File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stderr.write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stderr.flush()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

pub fn log_file_path(data_folder: &Path) -> PathBuf {
    data_folder.join(LOG_FILE_NAME)
}

/// `[INFO][2019/08/09 01:02:03 PM] message`
pub fn format_line(level: Level, timestamp: DateTime<Local>, message: &str) -> String {
    format!(
        "[{}][{}] {}",
        level,
        timestamp.format("%Y/%m/%d %I:%M:%S %p"),
        message
    )
}

/// Install the process logger. With `log_file` set, records are appended to
/// that file as well as stderr.
pub fn init_logging(level: LevelFilter, log_file: Option<&Path>) -> io::Result<()> {
    let file = match log_file {
        Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
        None => None,
    };
    let writer = TeeWriter {
        stderr: io::stderr(),
        file,
    };

    env_logger::Builder::new()
        .filter_level(level)
        .filter_module("serialport", LevelFilter::Warn)
        .format(|buf, record| {
            writeln!(
                buf,
                "{}",
                format_line(record.level(), Local::now(), &record.args().to_string())
            )
        })
        .target(env_logger::Target::Pipe(Box::new(writer)))
        .try_init()
        .map_err(io::Error::other)
}

pub fn flush() {
    log::logger().flush();
}

//! ProScan III ASCII command vocabulary and reply parsing.

use crate::error::StageError;
use crate::types::{Position, StageAxis};

/// Every outbound command ends with exactly one carriage return.
pub const TERMINATOR: char = '\r';
/// Reply to an accepted command, terminator stripped.
pub const DEFAULT_ACK: &str = "0";
pub const TTL_PIN_COUNT: u8 = 4;

pub const STANDARD_MODE: &str = "COMP";
pub const STATUS: &str = "$";
pub const POSITION: &str = "P";
pub const JOYSTICK_ENABLE: &str = "J";
pub const JOYSTICK_DISABLE: &str = "H";

/// Append the terminator, replacing any line ending the caller supplied.
pub fn normalize(command: &str) -> String {
    let mut line = command.trim_end_matches(['\r', '\n']).to_string();
    line.push(TERMINATOR);
    line
}

pub fn goto(position: &Position) -> String {
    format!("G {position}")
}

pub fn ttl(pin: u8, active: bool) -> String {
    format!("TTL {}, {}", pin, u8::from(active))
}

pub fn resolution(axis: StageAxis) -> String {
    format!("RES, {axis}")
}

/// Sum the per-axis integers of a `$` reply.
pub fn parse_status(reply: &str) -> Result<u32, StageError> {
    let mut fields = reply.split_whitespace().peekable();
    if fields.peek().is_none() {
        return Err(StageError::Protocol("Empty busy status reply".to_string()));
    }
    fields.try_fold(0u32, |sum, field| {
        field
            .parse::<u32>()
            .map(|value| sum + value)
            .map_err(|_| StageError::Protocol(format!("Malformed busy status reply {reply:?}")))
    })
}

/// Parse a `P` reply of the form `x,y,z`.
pub fn parse_position(reply: &str) -> Result<Position, StageError> {
    let values = reply
        .split(',')
        .map(|field| field.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| StageError::Protocol(format!("Malformed position reply {reply:?}")))?;

    match values.as_slice() {
        [x, y, z] => Ok(Position::new(*x, *y, *z)),
        _ => Err(StageError::Protocol(format!(
            "Expected 3 coordinates in position reply, got {reply:?}"
        ))),
    }
}

pub fn parse_resolution(reply: &str) -> Result<f64, StageError> {
    reply
        .trim()
        .parse::<f64>()
        .map_err(|_| StageError::Protocol(format!("Malformed resolution reply {reply:?}")))
}

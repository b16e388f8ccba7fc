//! In-process ProScan controller.
//!
//! Speaks the same ASCII vocabulary as the hardware so the controller,
//! scheduler and binary can run without a serial port. A [`SimulatorHandle`]
//! shares the device state for scripting replies and inspecting traffic.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use super::channel::Transport;
use super::protocol::{DEFAULT_ACK, TERMINATOR, TTL_PIN_COUNT};
use crate::types::Position;

const NACK: &str = "E,1";

#[derive(Debug)]
struct DeviceState {
    position: Position,
    handshake_reply: String,
    status_script: VecDeque<String>,
    move_polls: u32,
    busy_polls_left: u32,
    rejected: Vec<String>,
    resolution: f64,
    ttl: [bool; TTL_PIN_COUNT as usize],
    writes: VecDeque<String>,
    history_limit: Option<usize>,
    pending: VecDeque<String>,
    connected: bool,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            position: Position::new(0, 0, 0),
            handshake_reply: DEFAULT_ACK.to_string(),
            status_script: VecDeque::new(),
            move_polls: 0,
            busy_polls_left: 0,
            rejected: Vec::new(),
            resolution: 0.1,
            ttl: [false; TTL_PIN_COUNT as usize],
            writes: VecDeque::new(),
            history_limit: None,
            pending: VecDeque::new(),
            connected: true,
        }
    }
}

impl DeviceState {
    fn reply_to(&mut self, command: &str) -> String {
        if command == "COMP" {
            return self.handshake_reply.clone();
        }
        if self.rejected.iter().any(|prefix| command.starts_with(prefix.as_str())) {
            return NACK.to_string();
        }

        if let Some(coords) = command.strip_prefix("G ") {
            return match parse_triplet(coords) {
                Some(target) => {
                    self.position = target;
                    self.busy_polls_left = self.move_polls;
                    DEFAULT_ACK.to_string()
                }
                None => NACK.to_string(),
            };
        }
        if let Some(args) = command.strip_prefix("TTL ") {
            let mut fields = args.split(',').map(str::trim);
            let pin = fields.next().and_then(|p| p.parse::<usize>().ok());
            let state = fields.next().and_then(|s| s.parse::<u8>().ok());
            return match (pin, state) {
                (Some(pin), Some(state)) if pin < self.ttl.len() => {
                    self.ttl[pin] = state != 0;
                    DEFAULT_ACK.to_string()
                }
                _ => NACK.to_string(),
            };
        }

        match command {
            "$" => self.status_reply(),
            "P" => format!(
                "{},{},{}",
                self.position.x, self.position.y, self.position.z
            ),
            "J" | "H" => DEFAULT_ACK.to_string(),
            c if c.starts_with("RES") => self.resolution.to_string(),
            c if ["SM", "SA", "SC", "BL", "ENCODER ", "ENCW ", "SERVO "]
                .iter()
                .any(|prefix| c.starts_with(prefix)) =>
            {
                DEFAULT_ACK.to_string()
            }
            _ => NACK.to_string(),
        }
    }

    fn status_reply(&mut self) -> String {
        if let Some(scripted) = self.status_script.pop_front() {
            return scripted;
        }
        if self.busy_polls_left > 0 {
            self.busy_polls_left = self.busy_polls_left.saturating_sub(1);
            "3".to_string()
        } else {
            "0".to_string()
        }
    }
}

fn parse_triplet(coords: &str) -> Option<Position> {
    let values: Vec<i64> = coords
        .split(',')
        .map(|v| v.trim().parse().ok())
        .collect::<Option<_>>()?;
    match values.as_slice() {
        [x, y, z] => Some(Position::new(*x, *y, *z)),
        _ => None,
    }
}

pub struct SimulatedProScan {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedProScan {
    pub fn new() -> (Self, SimulatorHandle) {
        let state = Arc::new(Mutex::new(DeviceState::default()));
        (
            Self {
                state: state.clone(),
            },
            SimulatorHandle { state },
        )
    }
}

impl Transport for SimulatedProScan {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected"));
        }
        let raw = String::from_utf8_lossy(bytes).into_owned();
        let command = raw.trim_end_matches(TERMINATOR).to_string();
        state.writes.push_back(raw);
        if let Some(limit) = state.history_limit {
            while state.writes.len() > limit {
                state.writes.pop_front();
            }
        }
        let reply = state.reply_to(&command);
        state.pending.push_back(format!("{reply}{TERMINATOR}"));
        Ok(())
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected"));
        }
        state
            .pending
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no reply from device"))
    }

    fn discard_input(&mut self) -> io::Result<()> {
        self.state.lock().pending.clear();
        Ok(())
    }
}

/// Shared view onto a [`SimulatedProScan`] after it has been moved into a channel.
#[derive(Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatorHandle {
    /// Reply sent to `COMP`.
    pub fn set_handshake_reply(&self, reply: &str) {
        self.state.lock().handshake_reply = reply.to_string();
    }

    /// Queue literal replies for the next `$` queries.
    pub fn script_status<I, S>(&self, replies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state
            .lock()
            .status_script
            .extend(replies.into_iter().map(Into::into));
    }

    /// Number of `$` queries that report motion after each move.
    pub fn set_move_polls(&self, polls: u32) {
        self.state.lock().move_polls = polls;
    }

    /// Answer every command starting with `prefix` with an error reply.
    pub fn reject(&self, prefix: &str) {
        self.state.lock().rejected.push(prefix.to_string());
    }

    pub fn set_resolution(&self, resolution: f64) {
        self.state.lock().resolution = resolution;
    }

    /// Make every subsequent read and write fail.
    pub fn disconnect(&self) {
        self.state.lock().connected = false;
    }

    pub fn position(&self) -> Position {
        self.state.lock().position
    }

    pub fn ttl(&self, pin: usize) -> bool {
        self.state.lock().ttl.get(pin).copied().unwrap_or(false)
    }

    /// Keep only the most recent `limit` writes in the history.
    pub fn set_history_limit(&self, limit: usize) {
        let mut state = self.state.lock();
        state.history_limit = Some(limit);
        while state.writes.len() > limit {
            state.writes.pop_front();
        }
    }

    /// Bytes written, one entry per write, terminators included.
    pub fn raw_writes(&self) -> Vec<String> {
        self.state.lock().writes.iter().cloned().collect()
    }

    /// Commands received, terminators stripped.
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .writes
            .iter()
            .map(|w| w.trim_end_matches(TERMINATOR).to_string())
            .collect()
    }

    pub fn moves(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with("G "))
            .collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| c.as_str() == command).count()
    }

    pub fn clear_history(&self) {
        self.state.lock().writes.clear();
    }
}

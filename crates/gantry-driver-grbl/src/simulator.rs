//! In-memory GRBL controller for tests and `--simulate` runs.
//!
//! The simulator implements [`SerialPortIO`], so it plugs into
//! [`GrblDriver::attach`](crate::GrblDriver::attach) in place of a real port.
//! It answers every newline-terminated line with `ok`, answers each `?` with a
//! status report chosen by its [`IdleBehaviour`], and tracks its own machine
//! position honouring `G90`/`G91`.

use crate::driver::LinkSettings;
use gantry_core::limits::{DEFAULT_BAUD_RATE, SERIAL_TIMEOUT};
use gantry_core::serial::SerialPortIO;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;

/// How the simulator answers status requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleBehaviour {
    /// Report Idle on every poll.
    ImmediateIdle,
    /// Report Run forever.
    NeverIdle,
    /// Report Run for `n` polls after each move, then Idle.
    IdleAfterPolls(u32),
    /// Report `ALARM:1` on every poll.
    Alarm,
}

#[derive(Debug)]
struct SimState {
    behaviour: IdleBehaviour,
    received: Vec<String>,
    status_requests: u32,
    polls_since_move: u32,
    partial: Vec<u8>,
    outbound: VecDeque<u8>,
    relative: bool,
    x: f64,
    y: f64,
}

impl SimState {
    fn respond(&mut self, line: &str) {
        self.outbound.extend(line.bytes());
        self.outbound.extend(b"\r\n");
    }

    fn status_line(&mut self) -> String {
        self.status_requests += 1;
        self.polls_since_move = self.polls_since_move.saturating_add(1);
        let state = match self.behaviour {
            IdleBehaviour::ImmediateIdle => "Idle",
            IdleBehaviour::NeverIdle => "Run",
            IdleBehaviour::IdleAfterPolls(n) if self.polls_since_move > n => "Idle",
            IdleBehaviour::IdleAfterPolls(_) => "Run",
            IdleBehaviour::Alarm => return "ALARM:1".to_string(),
        };
        format!("<{}|MPos:{:.3},{:.3},0.000|FS:0,0>", state, self.x, self.y)
    }

    fn handle_line(&mut self, line: String) {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.first().copied() {
            Some("G90") => self.relative = false,
            Some("G91") => self.relative = true,
            Some("G1") | Some("G0") => {
                for word in &words[1..] {
                    let mut chars = word.chars();
                    let letter = chars.next();
                    let Ok(value) = chars.as_str().parse::<f64>() else {
                        continue;
                    };
                    let slot = match letter {
                        Some('X') => &mut self.x,
                        Some('Y') => &mut self.y,
                        _ => continue,
                    };
                    if self.relative {
                        *slot += value;
                    } else {
                        *slot = value;
                    }
                }
                self.polls_since_move = 0;
            }
            Some("$H") => {
                self.x = 0.0;
                self.y = 0.0;
            }
            _ => {}
        }
        self.received.push(line);
        self.respond("ok");
    }
}

/// Simulated controller endpoint. Hand it to the driver as its port.
pub struct SimulatedController {
    state: Arc<Mutex<SimState>>,
}

/// Shared view of a simulator for assertions after the driver owns the port.
#[derive(Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedController {
    /// New simulator. The startup banner is already queued, as after a reset.
    pub fn new(behaviour: IdleBehaviour) -> Self {
        let mut state = SimState {
            behaviour,
            received: Vec::new(),
            status_requests: 0,
            polls_since_move: 0,
            partial: Vec::new(),
            outbound: VecDeque::new(),
            relative: false,
            x: 0.0,
            y: 0.0,
        };
        state.respond("Grbl 1.1h ['$' for help]");
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Link settings to attach under.
    pub fn settings(&self) -> LinkSettings {
        LinkSettings::new("sim://grbl", DEFAULT_BAUD_RATE, SERIAL_TIMEOUT)
    }
}

impl SimulatorHandle {
    /// Every complete line received, in order, without terminators.
    pub fn received_lines(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }

    /// Number of `?` bytes received.
    pub fn status_requests(&self) -> u32 {
        self.state.lock().status_requests
    }

    /// Change the status behaviour mid-test.
    pub fn set_behaviour(&self, behaviour: IdleBehaviour) {
        self.state.lock().behaviour = behaviour;
    }

    /// The simulator's own idea of where the machine is.
    pub fn machine_position(&self) -> (f64, f64) {
        let state = self.state.lock();
        (state.x, state.y)
    }

    /// Whether the last positioning mode command was `G91`.
    pub fn is_relative(&self) -> bool {
        self.state.lock().relative
    }

    /// Queue an unsolicited line from the controller.
    pub fn inject(&self, line: &str) {
        self.state.lock().respond(line);
    }
}

impl Read for SimulatedController {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let n = buf.len().min(state.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedController {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        for &byte in buf {
            match byte {
                b'?' => {
                    let status = state.status_line();
                    state.respond(&status);
                }
                b'\n' => {
                    let raw = std::mem::take(&mut state.partial);
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if !line.is_empty() {
                        state.handle_line(line);
                    }
                }
                b'\r' => {}
                other => state.partial.push(other),
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialPortIO for SimulatedController {
    fn bytes_available(&mut self) -> io::Result<usize> {
        Ok(self.state.lock().outbound.len())
    }
}

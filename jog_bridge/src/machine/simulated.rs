use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::MachineInterface;
use crate::error::MachineError;
use crate::models::Position;

#[derive(Debug, Clone, PartialEq)]
pub enum MachineCall {
    Initialize,
    ReadPosition,
    IssueGcode(String),
    CancelMotion,
    Shutdown,
}

#[derive(Debug, Default)]
struct SimulatedState {
    position: Position,
    calls: Vec<MachineCall>,
    position_override: Option<Position>,
    fail_reads: bool,
    fail_gcode: bool,
    initialized: bool,
}

/// In-process stand-in for a controller: applies `G0` moves and `$J=`
/// jogs to a simulated position and records every call it receives.
#[derive(Debug, Default)]
pub struct SimulatedMachine {
    state: Mutex<SimulatedState>,
    gcode_delay: Duration,
}

impl SimulatedMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every G-code call take `delay` before it returns.
    pub fn with_gcode_delay(delay: Duration) -> Self {
        Self {
            gcode_delay: delay,
            ..Self::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, SimulatedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> Vec<MachineCall> {
        self.state().calls.clone()
    }

    pub fn gcode_history(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                MachineCall::IssueGcode(line) => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &MachineCall) -> usize {
        self.state().calls.iter().filter(|c| *c == call).count()
    }

    pub fn position(&self) -> Position {
        self.state().position
    }

    /// Reports `position` from `read_position` regardless of motion.
    pub fn set_position_override(&self, position: Option<Position>) {
        self.state().position_override = position;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state().fail_reads = fail;
    }

    pub fn set_fail_gcode(&self, fail: bool) {
        self.state().fail_gcode = fail;
    }

    pub fn is_initialized(&self) -> bool {
        self.state().initialized
    }
}

/// Leading numeric part of a coordinate word, so `10mm` reads as `10`.
fn coordinate_value(word: &str) -> Option<f64> {
    let end = word
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || ((c == '-' || c == '+') && i == 0)))
        .map(|(i, _)| i)
        .unwrap_or(word.len());
    word[..end].parse().ok()
}

fn apply_gcode(position: &mut Position, line: &str) {
    let line = line.trim();
    let (relative, words) = match line.strip_prefix("$J=") {
        Some(jog) => (true, jog),
        None => (false, line),
    };

    let mut relative = relative;
    let mut motion = relative;
    for word in words.split_whitespace() {
        match word {
            "G0" | "G00" | "G1" | "G01" => motion = true,
            "G90" => relative = false,
            "G91" => relative = true,
            _ => {}
        }
        // Modal words can be packed together as in `G21G91`.
        if word.contains("G91") {
            relative = true;
        }

        let mut chars = word.chars();
        let Some(letter) = chars.next() else { continue };
        let Some(value) = coordinate_value(chars.as_str()) else {
            continue;
        };
        if !motion {
            continue;
        }

        let target = match letter {
            'X' => &mut position.x,
            'Y' => &mut position.y,
            'Z' => &mut position.z,
            _ => continue,
        };
        if relative {
            *target += value;
        } else {
            *target = value;
        }
    }
}

#[async_trait]
impl MachineInterface for SimulatedMachine {
    async fn initialize(&self) -> Result<(), MachineError> {
        let mut state = self.state();
        state.calls.push(MachineCall::Initialize);
        state.initialized = true;
        info!("Simulated machine ready");
        Ok(())
    }

    async fn read_position(&self) -> Result<Position, MachineError> {
        let mut state = self.state();
        state.calls.push(MachineCall::ReadPosition);

        if state.fail_reads {
            return Err(MachineError::Read("simulated read failure".to_string()));
        }

        Ok(state.position_override.unwrap_or(state.position))
    }

    async fn issue_gcode(&self, line: &str) -> Result<(), MachineError> {
        {
            let mut state = self.state();
            state.calls.push(MachineCall::IssueGcode(line.to_string()));
            if state.fail_gcode {
                return Err(MachineError::Actuator(format!("simulated rejection of {}", line)));
            }
        }

        if !self.gcode_delay.is_zero() {
            tokio::time::sleep(self.gcode_delay).await;
        }

        let mut state = self.state();
        apply_gcode(&mut state.position, line);
        debug!("Simulated position now {:?}", state.position);
        Ok(())
    }

    async fn cancel_motion(&self) -> Result<(), MachineError> {
        self.state().calls.push(MachineCall::CancelMotion);
        Ok(())
    }

    async fn shutdown(&self) {
        let mut state = self.state();
        state.calls.push(MachineCall::Shutdown);
        state.initialized = false;
    }
}

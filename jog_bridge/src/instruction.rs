//! Decoding of command lines sent by the client application.
//!
//! Markers are found by substring search in a fixed priority order and the
//! first hit wins. Payloads are cut at fixed character offsets counted from
//! the start of the line, the way the client lays its lines out
//! (`/SetPosX 10mm`, `/JogStart+X 500`). An offset past the end of the line
//! gives an empty payload.

use crate::models::Axis;

pub const FILE_START: &str = "FileStart";
pub const JOG_STOP: &str = "JogStop";
pub const JOG_INC: &str = "JogInc";
pub const JOG_START: &str = "JogStart";
pub const EXECUTE: &str = "Execute";
pub const SET_POS_X: &str = "SetPosX";
pub const SET_POS_Y: &str = "SetPosY";
pub const SET_POS_Z: &str = "SetPosZ";
pub const GET_POS: &str = "GetPos";

const JOG_INC_PAYLOAD: usize = 8;
const JOG_START_DIRECTION: usize = 9;
const JOG_START_AXIS: usize = 10;
const JOG_START_FEEDRATE: usize = 12;
const EXECUTE_PAYLOAD: usize = 8;
const SET_POS_PAYLOAD: usize = 9;

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    FileStart { line: String },
    JogStop,
    JogIncrement { payload: String },
    /// Raw jog fields; validated when the jog tracker applies them.
    JogStart {
        direction: Option<char>,
        axis: Option<char>,
        feedrate: String,
    },
    Execute { gcode: String },
    SetPos { axis: Axis, value: String },
    GetPos,
}

impl Instruction {
    /// Instructions that end up as a G-code line on the machine.
    pub fn issues_gcode(&self) -> bool {
        matches!(
            self,
            Instruction::JogStart { .. } | Instruction::Execute { .. } | Instruction::SetPos { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Instruction::FileStart { .. } => FILE_START,
            Instruction::JogStop => JOG_STOP,
            Instruction::JogIncrement { .. } => JOG_INC,
            Instruction::JogStart { .. } => JOG_START,
            Instruction::Execute { .. } => EXECUTE,
            Instruction::SetPos { axis: Axis::X, .. } => SET_POS_X,
            Instruction::SetPos { axis: Axis::Y, .. } => SET_POS_Y,
            Instruction::SetPos { axis: Axis::Z, .. } => SET_POS_Z,
            Instruction::GetPos => GET_POS,
        }
    }
}

fn tail_from(line: &str, offset: usize) -> &str {
    match line.char_indices().nth(offset) {
        Some((idx, _)) => &line[idx..],
        None => "",
    }
}

fn char_at(line: &str, offset: usize) -> Option<char> {
    line.chars().nth(offset)
}

/// Returns `None` for lines that carry no known marker.
pub fn parse_instruction(line: &str) -> Option<Instruction> {
    let instruction = if line.contains(FILE_START) {
        Instruction::FileStart {
            line: line.to_string(),
        }
    } else if line.contains(JOG_STOP) {
        Instruction::JogStop
    } else if line.contains(JOG_INC) {
        Instruction::JogIncrement {
            payload: tail_from(line, JOG_INC_PAYLOAD).to_string(),
        }
    } else if line.contains(JOG_START) {
        Instruction::JogStart {
            direction: char_at(line, JOG_START_DIRECTION),
            axis: char_at(line, JOG_START_AXIS),
            feedrate: tail_from(line, JOG_START_FEEDRATE).to_string(),
        }
    } else if line.contains(EXECUTE) {
        Instruction::Execute {
            gcode: tail_from(line, EXECUTE_PAYLOAD).to_string(),
        }
    } else if line.contains(SET_POS_X) {
        set_pos(line, Axis::X)
    } else if line.contains(SET_POS_Y) {
        set_pos(line, Axis::Y)
    } else if line.contains(SET_POS_Z) {
        set_pos(line, Axis::Z)
    } else if line.contains(GET_POS) {
        Instruction::GetPos
    } else {
        return None;
    };

    Some(instruction)
}

fn set_pos(line: &str, axis: Axis) -> Instruction {
    Instruction::SetPos {
        axis,
        value: tail_from(line, SET_POS_PAYLOAD).to_string(),
    }
}

use tracing::debug;

use crate::error::InstructionError;
use crate::models::{
    JogAxis, JogAxisState, JogCommandSnapshot, JogDirection, inches_per_minute_to_mm_per_minute,
};

/// Distance of one continuous-jog step, in millimetres.
pub const JOG_STEP: f64 = 0.1;

/// Feed sent with every continuous jog.
///
/// NOTE: the effective feedrate is computed but not transmitted; the client
/// has always been driven with this fixed value. Revisit once the client's
/// feedrate units are confirmed.
pub const JOG_FEED: u32 = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct JogCommand {
    pub gcode: String,
    /// Inches per minute.
    pub effective_feedrate: f64,
    pub previous: JogCommandSnapshot,
    pub current: JogCommandSnapshot,
}

impl JogCommand {
    pub fn is_noop(&self) -> bool {
        self.previous == self.current
    }
}

/// Per-connection record of what the operator is currently jogging.
#[derive(Debug, Default)]
pub struct JogStateTracker {
    state: JogCommandSnapshot,
}

impl JogStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> JogCommandSnapshot {
        self.state
    }

    /// Validates the raw jog fields of a `JogStart` line and applies them.
    pub fn start_raw(
        &mut self,
        direction: Option<char>,
        axis: Option<char>,
        feedrate: &str,
    ) -> Result<JogCommand, InstructionError> {
        let axis = axis.and_then(JogAxis::from_char).ok_or_else(|| {
            InstructionError::Malformed(format!("unknown jog axis {:?}", axis))
        })?;
        let direction = JogDirection::from_char(direction).ok_or_else(|| {
            InstructionError::Malformed(format!("unknown jog direction {:?}", direction))
        })?;
        let feedrate = parse_feedrate(feedrate)?;

        Ok(self.start(axis, direction, feedrate))
    }

    pub fn start(&mut self, axis: JogAxis, direction: JogDirection, feedrate: f64) -> JogCommand {
        let previous = self.state;

        *self.state.axis_mut(axis) = JogAxisState {
            direction,
            feedrate,
        };

        let effective_feedrate = self.effective_feedrate();
        debug!(
            "Jog {}{} at {} in/min, effective {} mm/min",
            axis,
            direction,
            feedrate,
            inches_per_minute_to_mm_per_minute(effective_feedrate)
        );

        let motion = if direction.is_none() {
            String::new()
        } else {
            format!("{}{}{} ", axis, direction, JOG_STEP)
        };

        JogCommand {
            gcode: format!("$J=G21G91 {} F{}", motion, JOG_FEED),
            effective_feedrate,
            previous,
            current: self.state,
        }
    }

    /// A stationary axis does not constrain the feed; otherwise the slower
    /// axis wins.
    pub fn effective_feedrate(&self) -> f64 {
        let x = self.state.x.feedrate;
        let y = self.state.y.feedrate;

        if x == 0.0 {
            y
        } else if y == 0.0 {
            x
        } else {
            x.min(y)
        }
    }

    /// Jog stop leaves the tracked axes as they are.
    ///
    /// NOTE: the next start therefore merges with the direction and feedrate
    /// that were active before the stop. Kept until the client's expectations
    /// are clarified.
    pub fn stop(&mut self) {
        debug!("Jog stopped, keeping tracked state {:?}", self.state);
    }
}

fn parse_feedrate(text: &str) -> Result<f64, InstructionError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(0.0);
    }

    let feedrate: f64 = text
        .parse()
        .map_err(|_| InstructionError::Malformed(format!("invalid feedrate {:?}", text)))?;

    if !feedrate.is_finite() || feedrate < 0.0 {
        return Err(InstructionError::Malformed(format!(
            "feedrate must be a non-negative number, got {}",
            feedrate
        )));
    }

    Ok(feedrate)
}

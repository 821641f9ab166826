use std::fmt;

const MM_PER_INCH: f64 = 25.4;

pub fn inches_per_minute_to_mm_per_minute(feedrate: f64) -> f64 {
    feedrate * MM_PER_INCH
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'X' => Some(Axis::X),
            'Y' => Some(Axis::Y),
            'Z' => Some(Axis::Z),
            _ => None,
        }
    }

    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Axes that take part in continuous jogging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JogAxis {
    X,
    Y,
}

impl JogAxis {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'X' => Some(JogAxis::X),
            'Y' => Some(JogAxis::Y),
            _ => None,
        }
    }
}

impl From<JogAxis> for Axis {
    fn from(axis: JogAxis) -> Self {
        match axis {
            JogAxis::X => Axis::X,
            JogAxis::Y => Axis::Y,
        }
    }
}

impl fmt::Display for JogAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Axis::from(*self).fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JogDirection {
    #[default]
    None,
    Positive,
    Negative,
}

impl JogDirection {
    pub fn from_char(c: Option<char>) -> Option<Self> {
        match c {
            None => Some(JogDirection::None),
            Some('+') => Some(JogDirection::Positive),
            Some('-') => Some(JogDirection::Negative),
            Some(_) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JogDirection::None => "",
            JogDirection::Positive => "+",
            JogDirection::Negative => "-",
        }
    }

    pub fn is_none(self) -> bool {
        self == JogDirection::None
    }
}

impl fmt::Display for JogDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JogAxisState {
    pub direction: JogDirection,
    /// Inches per minute, as sent by the client.
    pub feedrate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct JogCommandSnapshot {
    pub x: JogAxisState,
    pub y: JogAxisState,
}

impl JogCommandSnapshot {
    pub fn axis_mut(&mut self, axis: JogAxis) -> &mut JogAxisState {
        match axis {
            JogAxis::X => &mut self.x,
            JogAxis::Y => &mut self.y,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub const UNKNOWN_COORDINATE: f64 = -1.0;

    pub const UNKNOWN: Position = Position {
        x: Self::UNKNOWN_COORDINATE,
        y: Self::UNKNOWN_COORDINATE,
        z: Self::UNKNOWN_COORDINATE,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// A single sentinel coordinate makes the whole reading unusable.
    pub fn is_known(&self) -> bool {
        [self.x, self.y, self.z]
            .iter()
            .all(|&c| c != Self::UNKNOWN_COORDINATE)
    }

    pub fn report_line(&self) -> String {
        format!("/position {} {} {}\n", self.x, self.y, self.z)
    }
}

impl Default for Position {
    fn default() -> Self {
        Position::new(0.0, 0.0, 0.0)
    }
}

//! Single-byte command codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Acquisition time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeWindow {
    Short,
    Long,
}

impl TimeWindow {
    pub const fn code(self) -> u8 {
        match self {
            TimeWindow::Short => 0b0011_0001,
            TimeWindow::Long => 0b0011_0111,
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeWindow::Short => write!(f, "SHORT"),
            TimeWindow::Long => write!(f, "LONG"),
        }
    }
}

/// Receiver gain level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gain {
    Level1,
    Level2,
    Level3,
    Level4,
    Level5,
}

impl Gain {
    pub const ALL: [Gain; 5] = [
        Gain::Level1,
        Gain::Level2,
        Gain::Level3,
        Gain::Level4,
        Gain::Level5,
    ];

    pub const fn code(self) -> u8 {
        match self {
            Gain::Level1 => 0b0011_0010,
            Gain::Level2 => 0b0011_0011,
            Gain::Level3 => 0b0011_0100,
            Gain::Level4 => 0b0011_0101,
            Gain::Level5 => 0b0011_0110,
        }
    }

    /// Gain from its 1-based level number.
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1..=5 => Some(Self::ALL[(level - 1) as usize]),
            _ => None,
        }
    }
}

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = Self::ALL.iter().position(|g| g == self).unwrap_or(0) + 1;
        write!(f, "LEVEL{}", level)
    }
}

/// A command byte on its way to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    TimeWindow(TimeWindow),
    Gain(Gain),
}

impl Command {
    pub const fn code(self) -> u8 {
        match self {
            Command::TimeWindow(w) => w.code(),
            Command::Gain(g) => g.code(),
        }
    }

    /// Decode a wire byte back into a command.
    pub fn from_code(code: u8) -> Option<Self> {
        if code == TimeWindow::Short.code() {
            return Some(Command::TimeWindow(TimeWindow::Short));
        }
        if code == TimeWindow::Long.code() {
            return Some(Command::TimeWindow(TimeWindow::Long));
        }
        Gain::ALL
            .into_iter()
            .find(|g| g.code() == code)
            .map(Command::Gain)
    }
}

impl From<TimeWindow> for Command {
    fn from(w: TimeWindow) -> Self {
        Command::TimeWindow(w)
    }
}

impl From<Gain> for Command {
    fn from(g: Gain) -> Self {
        Command::Gain(g)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::TimeWindow(w) => write!(f, "time window {} (0x{:02X})", w, w.code()),
            Command::Gain(g) => write!(f, "gain {} (0x{:02X})", g, g.code()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes() {
        assert_eq!(TimeWindow::Short.code(), 0x31);
        assert_eq!(TimeWindow::Long.code(), 0x37);
        let gains: Vec<u8> = Gain::ALL.iter().map(|g| g.code()).collect();
        assert_eq!(gains, vec![0x32, 0x33, 0x34, 0x35, 0x36]);
    }

    #[test]
    fn test_codes_fit_six_bits() {
        assert!(Gain::ALL.iter().all(|g| g.code() < 0x40));
        assert!(TimeWindow::Long.code() < 0x40);
    }

    #[test]
    fn test_from_code() {
        assert_eq!(
            Command::from_code(0x37),
            Some(Command::TimeWindow(TimeWindow::Long))
        );
        assert_eq!(Command::from_code(0x34), Some(Command::Gain(Gain::Level3)));
        assert_eq!(Command::from_code(0x30), None);
    }

    #[test]
    fn test_gain_from_level() {
        assert_eq!(Gain::from_level(1), Some(Gain::Level1));
        assert_eq!(Gain::from_level(5), Some(Gain::Level5));
        assert_eq!(Gain::from_level(0), None);
        assert_eq!(Gain::from_level(6), None);
        assert_eq!(Gain::Level4.to_string(), "LEVEL4");
    }
}

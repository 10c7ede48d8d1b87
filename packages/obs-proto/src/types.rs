//! Device, plan and coordinate-system state codes shared by both dialects.
//!
//! The numeric values are wire values: GWAC `status` frames carry mount
//! states as single digits, KV `state=` keys carry the same integers in
//! decimal.

use std::fmt;

// ── Observation system flavour ────────────────────────────────────────────────

/// Which device family an observation system talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObssType {
    /// Wide-angle array: multiplexed mount/focus endpoints, positional dialect.
    Gwac,
    /// Follow-up telescope: one endpoint per device, KV dialect.
    Gft,
}

// ── Mount ─────────────────────────────────────────────────────────────────────

/// Mount state as reported by the device. `-1` on the wire means unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum MountState {
    Error = 0,
    Freeze = 1,
    Homing = 2,
    Homed = 3,
    Parking = 4,
    Parked = 5,
    Slewing = 6,
    Tracking = 7,
    Guiding = 8,
}

impl MountState {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Error),
            1 => Some(Self::Freeze),
            2 => Some(Self::Homing),
            3 => Some(Self::Homed),
            4 => Some(Self::Parking),
            5 => Some(Self::Parked),
            6 => Some(Self::Slewing),
            7 => Some(Self::Tracking),
            8 => Some(Self::Guiding),
            _ => None,
        }
    }

    /// A mount that will accept a `track` command.
    pub fn is_stationary(self) -> bool {
        matches!(self, Self::Freeze | Self::Homed | Self::Parked)
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "Error",
            Self::Freeze => "Freeze",
            Self::Homing => "Homing",
            Self::Homed => "Homed",
            Self::Parking => "Parking",
            Self::Parked => "Parked",
            Self::Slewing => "Slewing",
            Self::Tracking => "Tracking",
            Self::Guiding => "Guiding",
        };
        f.write_str(s)
    }
}

// ── Camera ────────────────────────────────────────────────────────────────────

/// Camera control state as reported by the camera process.
///
/// Everything above `Idle` counts as busy; `WaitFlat` additionally takes part
/// in the flat-field re-pointing coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum CameraState {
    Error = 0,
    Idle = 1,
    Exposing = 2,
    ImageReady = 3,
    Paused = 4,
    WaitTime = 5,
    WaitFlat = 6,
}

/// Wire code of [`CameraState::Error`].
pub const CAMERA_ERROR: i32 = 0;
/// Wire code of [`CameraState::Idle`]; `state > CAMERA_IDLE` means busy.
pub const CAMERA_IDLE: i32 = 1;
/// Wire code of [`CameraState::WaitFlat`].
pub const CAMERA_WAIT_FLAT: i32 = 6;

impl CameraState {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Error),
            1 => Some(Self::Idle),
            2 => Some(Self::Exposing),
            3 => Some(Self::ImageReady),
            4 => Some(Self::Paused),
            5 => Some(Self::WaitTime),
            6 => Some(Self::WaitFlat),
            _ => None,
        }
    }
}

// ── Exposure commands ─────────────────────────────────────────────────────────

/// `expose` command codes.
pub const EXP_START: i32 = 0;
pub const EXP_STOP: i32 = 1;
pub const EXP_PAUSE: i32 = 2;

// ── Observation plan ──────────────────────────────────────────────────────────

/// Lifecycle state of an observation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i8)]
pub enum PlanState {
    /// No plan with the queried serial exists.
    #[default]
    Error = 0,
    Cataloged = 1,
    Allocated = 2,
    Waiting = 3,
    Running = 4,
    Over = 5,
    Interrupted = 6,
    Abandoned = 7,
    Deleted = 8,
}

impl PlanState {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Cataloged,
            2 => Self::Allocated,
            3 => Self::Waiting,
            4 => Self::Running,
            5 => Self::Over,
            6 => Self::Interrupted,
            7 => Self::Abandoned,
            8 => Self::Deleted,
            _ => Self::Error,
        }
    }

    /// A terminal state frees the unit for the next plan.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Over | Self::Interrupted | Self::Abandoned | Self::Deleted
        )
    }
}

impl fmt::Display for PlanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "Error",
            Self::Cataloged => "Cataloged",
            Self::Allocated => "Allocated",
            Self::Waiting => "Waiting",
            Self::Running => "Running",
            Self::Over => "Over",
            Self::Interrupted => "Interrupted",
            Self::Abandoned => "Abandoned",
            Self::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

// ── Coordinate systems ────────────────────────────────────────────────────────

/// Target coordinate system of a plan or slew request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i8)]
pub enum CoordSystem {
    AltAzimuth = 0,
    #[default]
    Equatorial = 1,
    /// Two-line orbital elements.
    Tle = 2,
}

impl CoordSystem {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::AltAzimuth),
            1 => Some(Self::Equatorial),
            2 => Some(Self::Tle),
            _ => None,
        }
    }
}

// ── GWAC command targets ──────────────────────────────────────────────────────

/// Which multiplexed GWAC endpoint an outbound command is bound for.
/// Retransmission bookkeeping is kept per device so a dropped focuser does
/// not leave stale mount commands behind (and vice versa).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GwacDevice {
    Mount,
    Focus,
}

// ── Image types ───────────────────────────────────────────────────────────────

/// Default object id derived from the image type when a plan omits `objid`.
pub fn default_objid(imgtype: &str) -> &'static str {
    if imgtype.eq_ignore_ascii_case("BIAS") {
        "bias"
    } else if imgtype.eq_ignore_ascii_case("DARK") {
        "dark"
    } else if imgtype.eq_ignore_ascii_case("FLAT") {
        "flat"
    } else if imgtype.eq_ignore_ascii_case("FOCUS") {
        "focs"
    } else {
        "objt"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_state_codes_round_trip() {
        for code in 0..=8 {
            let state = MountState::from_code(code).unwrap();
            assert_eq!(state as i32, code);
        }
        assert!(MountState::from_code(9).is_none());
        assert!(MountState::from_code(-1).is_none());
    }

    #[test]
    fn plan_terminal_states() {
        assert!(PlanState::Over.is_terminal());
        assert!(PlanState::Interrupted.is_terminal());
        assert!(PlanState::Abandoned.is_terminal());
        assert!(PlanState::Deleted.is_terminal());
        assert!(!PlanState::Cataloged.is_terminal());
        assert!(!PlanState::Running.is_terminal());
    }

    #[test]
    fn objid_defaults_follow_imgtype() {
        assert_eq!(default_objid("BIAS"), "bias");
        assert_eq!(default_objid("dark"), "dark");
        assert_eq!(default_objid("Flat"), "flat");
        assert_eq!(default_objid("FOCUS"), "focs");
        assert_eq!(default_objid("OBJECT"), "objt");
        assert_eq!(default_objid("anything"), "objt");
    }
}

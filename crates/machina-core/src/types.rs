//! Shared identifier and run-scoped types.
//!
//! An AID is the stable tool identifier used for audit and learning
//! (`AID.ERROR_SCAN.v1`). A [`Sid`] is the compact per-menu short id assigned
//! deterministically for a single step; selectors address tools by SID so the
//! menu is the only binding between the two within a step.

use serde::{Deserialize, Serialize};

/// Stable tool identifier, e.g. `AID.ERROR_SCAN.v1`.
pub type Aid = String;

/// The reserved no-op tool id appended to every menu when registered.
pub const NOOP_AID: &str = "AID.NOOP.v1";

/// The help-request tool executed once on an `ASK_SUP` selection.
pub const ASK_SUP_AID: &str = "AID.ASK_SUP.v1";

/// Largest SID the four-digit wire form can carry. Menu assembly never
/// assigns above this; a larger `Sid` value has no parseable wire form.
pub const MAX_WIRE_SID: u16 = 9999;

/// Compact per-run session id. The wire form (`SIDdddd`) is fixed at four
/// digits, so assignable values run 1..=[`MAX_WIRE_SID`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sid(pub u16);

impl Sid {
    /// Renders the SID in its wire form, e.g. `SID0007`.
    ///
    /// Values above [`MAX_WIRE_SID`] render with more than four digits and
    /// do not round-trip through [`Sid::parse`]; menu assembly keeps SIDs
    /// under the cap.
    #[must_use]
    pub fn to_wire(self) -> String {
        format!("SID{:04}", self.0)
    }

    /// Parses a wire-form SID token (`SIDdddd`).
    ///
    /// Returns `None` for anything that is not exactly `SID` followed by four
    /// ASCII digits.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let digits = s.strip_prefix("SID")?;
        if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u16>().ok().map(Sid)
    }
}

impl std::fmt::Display for Sid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire())
    }
}

/// Outcome of a single tool invocation or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// The tool ran and its workspace mutations should be committed.
    Ok,
    /// The selection could not be applied to the current menu.
    InvalidPick,
    /// The tool reported failure; the transaction is rolled back.
    ToolError,
    /// A budget or circuit breaker ended the run.
    BreakerTrip,
}

impl StepStatus {
    /// Wire name used in toolhost responses and journal payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::InvalidPick => "INVALID_PICK",
            Self::ToolError => "TOOL_ERROR",
            Self::BreakerTrip => "BREAKER_TRIP",
        }
    }

    /// Parses a wire name; unknown strings map to `ToolError` so a malformed
    /// toolhost response can never masquerade as success.
    #[must_use]
    pub fn from_wire(s: &str) -> Self {
        match s {
            "OK" => Self::Ok,
            "INVALID_PICK" => Self::InvalidPick,
            "BREAKER_TRIP" => Self::BreakerTrip,
            _ => Self::ToolError,
        }
    }
}

/// Identity fields stamped on every journal record of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHeader {
    /// Specification version the run was executed under.
    pub spec_version: String,
    /// Execution profile id.
    pub profile_id: String,
    /// Unique run id.
    pub run_id: String,
    /// Caller-supplied tracing id; empty when the caller did not send one.
    #[serde(default)]
    pub request_id: String,
}

impl RunHeader {
    /// Creates a header with a fresh random run id.
    #[must_use]
    pub fn new() -> Self {
        Self {
            spec_version: "1.4.2".to_string(),
            profile_id: "A".to_string(),
            run_id: uuid::Uuid::new_v4().simple().to_string(),
            request_id: String::new(),
        }
    }
}

impl Default for RunHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Hard limits for a single run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum number of steps before the run trips the breaker.
    pub max_steps: u32,
    /// Maximum tolerated invalid picks before the run trips the breaker.
    pub max_invalid_picks: u32,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_steps: 64,
            max_invalid_picks: 8,
        }
    }
}

/// Milliseconds since the Unix epoch (wall clock).
#[must_use]
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sid_wire_round_trip_within_cap() {
        for v in [1u16, 7, 42, 999, MAX_WIRE_SID] {
            let wire = Sid(v).to_wire();
            assert_eq!(Sid::parse(&wire), Some(Sid(v)));
        }
    }

    #[test]
    fn sid_parse_rejects_malformed() {
        assert_eq!(Sid::parse(""), None);
        assert_eq!(Sid::parse("SID12"), None);
        assert_eq!(Sid::parse("SID12345"), None);
        assert_eq!(Sid::parse("sid0001"), None);
        assert_eq!(Sid::parse("SID00a1"), None);
        // Above the cap the wire form grows to five digits, which strict
        // parsing refuses; such values are never menu-assigned.
        assert_eq!(Sid::parse(&Sid(u16::MAX).to_wire()), None);
    }

    #[test]
    fn step_status_wire_names() {
        assert_eq!(StepStatus::Ok.as_str(), "OK");
        assert_eq!(StepStatus::from_wire("OK"), StepStatus::Ok);
        assert_eq!(StepStatus::from_wire("INVALID_PICK"), StepStatus::InvalidPick);
        // Unknown statuses degrade to ToolError, never to Ok.
        assert_eq!(StepStatus::from_wire("SOMETHING"), StepStatus::ToolError);
        assert_eq!(StepStatus::from_wire(""), StepStatus::ToolError);
    }

    #[test]
    fn run_header_defaults() {
        let hdr = RunHeader::new();
        assert_eq!(hdr.spec_version, "1.4.2");
        assert_eq!(hdr.profile_id, "A");
        assert_eq!(hdr.run_id.len(), 32);
        assert!(hdr.request_id.is_empty());
    }
}

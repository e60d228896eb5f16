//! Relay lifecycle stages.

use core::fmt;

/// Progress of a relay.
///
/// ```notrust
/// Scanning -> Cloning -> WaitingForMaster -> MasterLinkEstablishing -> ActiveRelay -> Stopped
///                              ^                       |                    |
///                              +-------- master link disconnected ----------+
/// ```
///
/// Stages only move forward, except for the master-link reset shown above. `Stopped` is final and
/// can be entered from anywhere.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// Looking for the target's advertisements.
    Scanning,
    /// Copying the target's advertising data to the master-facing link.
    Cloning,
    /// Advertising as the target, waiting for the real central to connect.
    WaitingForMaster,
    /// The real central is connected, pairing on one or both links is in progress.
    MasterLinkEstablishing,
    /// Both links are paired; application traffic is forwarded.
    ActiveRelay,
    Stopped,
}

impl Stage {
    /// Returns whether a relay in this stage may move to `next`.
    pub fn can_advance_to(self, next: Stage) -> bool {
        match (self, next) {
            (Stage::Stopped, _) => false,
            (_, Stage::Stopped) => true,
            (Stage::MasterLinkEstablishing, Stage::WaitingForMaster)
            | (Stage::ActiveRelay, Stage::WaitingForMaster) => true,
            (from, to) => to > from,
        }
    }

    /// Returns whether application traffic is forwarded immediately in this stage.
    pub fn is_relaying(self) -> bool {
        self == Stage::ActiveRelay
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Scanning => "scanning",
            Stage::Cloning => "cloning",
            Stage::WaitingForMaster => "waiting for master",
            Stage::MasterLinkEstablishing => "establishing master link",
            Stage::ActiveRelay => "relaying",
            Stage::Stopped => "stopped",
        })
    }
}

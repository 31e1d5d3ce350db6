//! The compiler phase machine.
//!
//! One process-wide phase variable advances monotonically through the
//! pipeline; every driver operation asserts the phase it requires before
//! touching shared state. The phase only changes on the driver thread,
//! between phases, while no workers are running.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum Phase {
    /// Start-up; nothing parsed yet.
    Init = 0,
    /// Top-level definitions arrive through the definition protocol.
    Parse = 1,
    /// Single-threaded validation after parsing completes.
    ParseCleanup = 2,
    /// Struct flattening and gmember emplacement.
    CountMembers = 3,
    /// Dependency order construction for the precheck phase.
    OrderPrecheck = 4,
    /// Parallel precheck over the ready queue.
    Precheck = 5,
    /// Dependency order construction for the compile phase.
    OrderCompile = 6,
    /// Parallel compilation over the ready queue.
    Compile = 7,
    /// RAM/ROM allocation (driven externally).
    AllocRam = 8,
}

impl Phase {
    const ALL: [Self; 9] = [
        Self::Init,
        Self::Parse,
        Self::ParseCleanup,
        Self::CountMembers,
        Self::OrderPrecheck,
        Self::Precheck,
        Self::OrderCompile,
        Self::Compile,
        Self::AllocRam,
    ];

    fn from_u8(value: u8) -> Self {
        Self::ALL[value as usize]
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Parse => "parse",
            Self::ParseCleanup => "parse-cleanup",
            Self::CountMembers => "count-members",
            Self::OrderPrecheck => "order-precheck",
            Self::Precheck => "precheck",
            Self::OrderCompile => "order-compile",
            Self::Compile => "compile",
            Self::AllocRam => "alloc-ram",
        };
        write!(f, "{name}")
    }
}

/// The process-wide phase variable.
#[derive(Debug, Default)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    /// Creates a cell at [`Phase::Init`].
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(Phase::Init as u8))
    }

    /// The current phase.
    #[must_use]
    pub fn get(&self) -> Phase {
        Phase::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Advances to `next`.
    ///
    /// # Panics
    ///
    /// Panics when `next` does not strictly follow the current phase in
    /// the pipeline ordering.
    pub fn advance_to(&self, next: Phase) {
        let current = self.get();
        assert!(
            next > current,
            "phase may only advance (currently {current}, requested {next})"
        );
        self.0.store(next as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::{Phase, PhaseCell};

    #[test]
    fn starts_at_init() {
        assert_eq!(PhaseCell::new().get(), Phase::Init);
    }

    #[test]
    fn advances_through_the_pipeline() {
        let cell = PhaseCell::new();
        cell.advance_to(Phase::Parse);
        cell.advance_to(Phase::ParseCleanup);
        cell.advance_to(Phase::CountMembers);
        assert_eq!(cell.get(), Phase::CountMembers);
    }

    #[test]
    fn phases_are_totally_ordered() {
        assert!(Phase::Parse < Phase::ParseCleanup);
        assert!(Phase::OrderPrecheck < Phase::Precheck);
        assert!(Phase::Precheck < Phase::OrderCompile);
        assert!(Phase::Compile < Phase::AllocRam);
    }

    #[test]
    #[should_panic(expected = "phase may only advance")]
    fn retreating_panics() {
        let cell = PhaseCell::new();
        cell.advance_to(Phase::Precheck);
        cell.advance_to(Phase::Parse);
    }

    #[test]
    fn displays_dashed_names() {
        assert_eq!(Phase::ParseCleanup.to_string(), "parse-cleanup");
        assert_eq!(Phase::OrderCompile.to_string(), "order-compile");
    }
}

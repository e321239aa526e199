/// Whether an observed version should replace the tracked one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VersionDecision {
    /// The candidate is newer; adopt it.
    Advance,
    /// The candidate is not newer; ignore it.
    StaleIgnore,
}

/// Decides whether `candidate` supersedes `current`.
#[must_use]
pub const fn accept(candidate: u64, current: Option<u64>) -> VersionDecision {
    match current {
        Some(current) if candidate <= current => VersionDecision::StaleIgnore,
        _ => VersionDecision::Advance,
    }
}

/// The last version seen for one replica.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackedVersion(Option<u64>);

impl TrackedVersion {
    /// Starts from a known version.
    #[must_use]
    pub const fn at(version: u64) -> Self {
        Self(Some(version))
    }

    /// The current version, if any has been observed.
    #[must_use]
    pub const fn current(&self) -> Option<u64> {
        self.0
    }

    /// Applies the version policy, advancing on a newer candidate.
    pub const fn observe(&mut self, candidate: u64) -> VersionDecision {
        let decision = accept(candidate, self.0);
        if matches!(decision, VersionDecision::Advance) {
            self.0 = Some(candidate);
        }
        decision
    }
}

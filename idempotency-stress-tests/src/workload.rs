use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Issue a brand new idempotency key with a fresh request body.
    NewKey,
    /// Reuse a previously-issued key with the same body that produced it — should replay.
    RepeatKey,
    /// Reuse a previously-issued key with a different body — should be rejected.
    MismatchKey,
}

/// Workload profiles controlling the mix of operations the worker issues.
///
/// | Profile     | NewKey % | RepeatKey % | MismatchKey % |
/// |-------------|----------|-------------|---------------|
/// | Typical     |    80    |     20      |      0        |
/// | RetryHeavy  |    40    |     55      |      5        |
/// | Conflicted  |    50    |     20      |     30        |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadProfile {
    Typical,
    RetryHeavy,
    Conflicted,
}

impl WorkloadProfile {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "typical" => Some(WorkloadProfile::Typical),
            "retry-heavy" => Some(WorkloadProfile::RetryHeavy),
            "conflicted" => Some(WorkloadProfile::Conflicted),
            _ => None,
        }
    }

    pub fn as_name(&self) -> &'static str {
        match self {
            WorkloadProfile::Typical => "typical",
            WorkloadProfile::RetryHeavy => "retry-heavy",
            WorkloadProfile::Conflicted => "conflicted",
        }
    }

    /// Draw a random operation using `rng`.
    pub fn sample(&self, rng: &mut impl Rng) -> Op {
        let roll: u32 = rng.gen_range(0..100);
        self.op_for_roll(roll)
    }

    /// Map a roll in `0..100` to an `Op` according to the profile's percentages.
    /// Exposed for deterministic testing.
    pub fn op_for_roll(&self, roll: u32) -> Op {
        match self {
            WorkloadProfile::Typical => {
                // NewKey 80%, RepeatKey 20%
                if roll < 80 { Op::NewKey } else { Op::RepeatKey }
            }
            WorkloadProfile::RetryHeavy => {
                // NewKey 40%, RepeatKey 55%, MismatchKey 5%
                if roll < 40 { Op::NewKey } else if roll < 95 { Op::RepeatKey } else { Op::MismatchKey }
            }
            WorkloadProfile::Conflicted => {
                // NewKey 50%, RepeatKey 20%, MismatchKey 30%
                if roll < 50 { Op::NewKey } else if roll < 70 { Op::RepeatKey } else { Op::MismatchKey }
            }
        }
    }
}

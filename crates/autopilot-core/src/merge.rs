/// Outcome of the auto-merge gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeDecision {
    pub merge: bool,
    /// One entry per failed gate, in gate order. Empty iff `merge`.
    pub reasons: Vec<String>,
}

pub const REASON_CI: &str = "CI checks failed";
pub const REASON_REVIEW: &str = "Review requested changes";
pub const REASON_SECURITY: &str = "Security audit found issues";

/// Merge only when every gate passed.
pub fn decide(ci_passed: bool, review_approved: bool, security_passed: bool) -> MergeDecision {
    let mut reasons = Vec::new();
    if !ci_passed {
        reasons.push(REASON_CI.to_string());
    }
    if !review_approved {
        reasons.push(REASON_REVIEW.to_string());
    }
    if !security_passed {
        reasons.push(REASON_SECURITY.to_string());
    }
    MergeDecision {
        merge: reasons.is_empty(),
        reasons,
    }
}

use super::storage::entities::{BudgetKind, DomainBudget};

/// In strict mode, excess beyond this many seconds escalates from a
/// dismissible notification to a blocking presentation.
pub const STRICT_EXCESS_SECONDS: u64 = 300;

/// What the presentation layer is asked to do once a limit is exceeded.
/// Rendering is someone else's problem; this is only the decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnforcementAction {
    Floating { domain: String, question: String },
    Blocking { domain: String, question: String },
}

impl EnforcementAction {
    pub fn domain(&self) -> &str {
        match self {
            Self::Floating { domain, .. } | Self::Blocking { domain, .. } => domain,
        }
    }
}

/// Classifies a domain against the budget lists. Distraction entries take
/// precedence over productive ones, and within a list the first match wins.
pub fn classify(
    domain: &str,
    distraction: &[DomainBudget],
    productive: &[DomainBudget],
) -> Option<BudgetKind> {
    if find_budget(domain, distraction).is_some() {
        Some(BudgetKind::Distraction)
    } else if find_budget(domain, productive).is_some() {
        Some(BudgetKind::Productive)
    } else {
        None
    }
}

/// First budget whose stored URL resolves to exactly this domain.
pub fn find_budget<'a>(domain: &str, budgets: &'a [DomainBudget]) -> Option<&'a DomainBudget> {
    budgets.iter().find(|budget| budget.domain() == domain)
}

/// Excess seconds over the limit, or None while still under it. Hitting the
/// limit exactly counts as exceeded with zero excess.
pub fn excess_seconds(time_spent: u64, limit_seconds: u64) -> Option<u64> {
    if time_spent >= limit_seconds {
        Some(time_spent - limit_seconds)
    } else {
        None
    }
}

/// Escalation policy for an exceeded budget. Returns the kind of
/// presentation to request, or None when neither mode applies.
pub fn decide_presentation(
    excess: u64,
    strict_mode: bool,
    notifications_enabled: bool,
) -> Option<Presentation> {
    if strict_mode && excess > STRICT_EXCESS_SECONDS {
        Some(Presentation::Blocking)
    } else if notifications_enabled {
        Some(Presentation::Floating)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    Floating,
    Blocking,
}

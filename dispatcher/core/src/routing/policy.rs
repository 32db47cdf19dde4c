//! Selection Policy
//!
//! Pure decision function mapping a request's requirements to a backend id.
//!
//! # Selection Flow
//!
//! ```text
//! 1. Caller preference override (enabled, capable, large enough)
//! 2. Capability intersection over the capability map
//! 3. Token threshold filter
//! 4. Cost tier filter (advisory or strict)
//! 5. Lowest priority wins
//!    -> any dead end falls back to the default backend
//! ```
//!
//! The policy never rejects a request. Missing data degrades to the
//! default backend and is logged at debug level; the caller of
//! [`SelectionPolicy::select`] decides what to do when even the default is
//! unusable.

use serde::{Deserialize, Serialize};

use super::registry::{CallerPreferences, RegistrySnapshot};

// ============================================================================
// Selection Criteria
// ============================================================================

/// What a request needs from a backend
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionCriteria {
    /// Capabilities the backend must provide
    pub capabilities: Vec<String>,

    /// Estimated tokens (input + output)
    pub token_estimate: Option<u64>,

    /// Submitting caller
    pub caller_id: Option<String>,

    /// Requested cost tier
    pub cost_tier: Option<String>,
}

impl SelectionCriteria {
    /// Criteria requiring the given capabilities
    pub fn new<I, S>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Set the token estimate
    #[must_use]
    pub fn with_token_estimate(mut self, tokens: u64) -> Self {
        self.token_estimate = Some(tokens);
        self
    }

    /// Set the caller
    #[must_use]
    pub fn with_caller(mut self, caller_id: impl Into<String>) -> Self {
        self.caller_id = Some(caller_id.into());
        self
    }

    /// Set the cost tier
    #[must_use]
    pub fn with_cost_tier(mut self, tier: impl Into<String>) -> Self {
        self.cost_tier = Some(tier.into());
        self
    }

    /// Token estimate, zero when unknown
    #[must_use]
    pub fn tokens(&self) -> u64 {
        self.token_estimate.unwrap_or(0)
    }
}

// ============================================================================
// Selection Result
// ============================================================================

/// How strictly cost tiers constrain selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTierMode {
    /// An empty tier intersection falls back to the untiered candidates
    #[default]
    Advisory,
    /// An empty tier intersection falls back to the default backend
    Strict,
}

impl std::str::FromStr for CostTierMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "advisory" => Ok(Self::Advisory),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown cost tier mode: {other}")),
        }
    }
}

/// Why a backend was chosen
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SelectionReason {
    /// Caller explicitly named the backend
    Pinned,
    /// Caller's preferred backend satisfied the request
    CallerPreference,
    /// Best remaining candidate by priority
    Candidate {
        /// Candidates left after filtering
        remaining: usize,
        /// Whether the cost tier filter had to be relaxed
        cost_tier_relaxed: bool,
    },
    /// Default backend: no capabilities were requested
    DefaultNoCapabilities,
    /// Default backend: a capability has no mapping
    DefaultUnmappedCapability {
        /// The unmapped capability
        capability: String,
    },
    /// Default backend: filtering removed every candidate
    DefaultNoCandidates,
    /// Default backend: strict cost tier filtering removed every candidate
    DefaultCostTier,
}

impl std::fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pinned => write!(f, "pinned by caller"),
            Self::CallerPreference => write!(f, "caller preference"),
            Self::Candidate {
                remaining,
                cost_tier_relaxed,
            } => {
                write!(f, "best of {remaining} candidate(s)")?;
                if *cost_tier_relaxed {
                    write!(f, ", cost tier relaxed")?;
                }
                Ok(())
            }
            Self::DefaultNoCapabilities => write!(f, "default: no capabilities requested"),
            Self::DefaultUnmappedCapability { capability } => {
                write!(f, "default: capability '{capability}' is unmapped")
            }
            Self::DefaultNoCandidates => write!(f, "default: no candidates left"),
            Self::DefaultCostTier => write!(f, "default: no candidates in cost tier"),
        }
    }
}

/// The policy's decision
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// Chosen backend (may be a default that is not currently enabled)
    pub backend_id: String,
    /// Why it was chosen
    pub reason: SelectionReason,
}

impl Selection {
    fn new(backend_id: impl Into<String>, reason: SelectionReason) -> Self {
        Self {
            backend_id: backend_id.into(),
            reason,
        }
    }
}

// ============================================================================
// Selection Policy
// ============================================================================

/// The selection policy engine
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectionPolicy {
    cost_tier_mode: CostTierMode,
}

impl SelectionPolicy {
    /// Policy with the given cost tier mode
    #[must_use]
    pub fn new(cost_tier_mode: CostTierMode) -> Self {
        Self { cost_tier_mode }
    }

    /// Configured cost tier mode
    #[must_use]
    pub fn cost_tier_mode(&self) -> CostTierMode {
        self.cost_tier_mode
    }

    /// Choose a backend
    ///
    /// Returns `None` only when selection falls through to the default and
    /// no default backend is configured.
    #[must_use]
    pub fn select(
        &self,
        snapshot: &RegistrySnapshot,
        criteria: &SelectionCriteria,
    ) -> Option<Selection> {
        let rules = snapshot.rules();
        let tokens = criteria.tokens();
        let preferences = criteria
            .caller_id
            .as_deref()
            .and_then(|caller| rules.preferences_for(caller));

        // 1. Caller preference
        if let Some(preferred) = preferences.and_then(|p| p.preferred_backend.as_deref()) {
            match snapshot.definition(preferred) {
                Some(def)
                    if def.supports_all(criteria.capabilities.as_slice())
                        && def.max_tokens >= tokens =>
                {
                    return Some(Selection::new(preferred, SelectionReason::CallerPreference));
                }
                Some(_) => {
                    tracing::debug!(
                        caller = ?criteria.caller_id,
                        backend = preferred,
                        "Preferred backend cannot serve request"
                    );
                }
                None => {
                    tracing::debug!(
                        caller = ?criteria.caller_id,
                        backend = preferred,
                        "Preferred backend is not enabled"
                    );
                }
            }
        }

        // 2. Capability intersection
        let Some((first, rest)) = criteria.capabilities.split_first() else {
            return self.default_backend(snapshot, SelectionReason::DefaultNoCapabilities);
        };
        let Some(seed) = rules.capability_map.get(first) else {
            return self.default_backend(
                snapshot,
                SelectionReason::DefaultUnmappedCapability {
                    capability: first.clone(),
                },
            );
        };

        let mut candidates: Vec<&str> = seed.iter().map(String::as_str).collect();
        for capability in rest {
            let Some(mapped) = rules.capability_map.get(capability) else {
                return self.default_backend(
                    snapshot,
                    SelectionReason::DefaultUnmappedCapability {
                        capability: capability.clone(),
                    },
                );
            };
            candidates.retain(|c| mapped.iter().any(|m| m == c));
        }
        dedup_preserving_order(&mut candidates);
        candidates.retain(|c| snapshot.contains(c) && !is_excluded(preferences, c));

        // 3. Token thresholds
        candidates.retain(|c| {
            rules
                .token_thresholds
                .get(*c)
                .is_some_and(|threshold| *threshold >= tokens)
        });

        // 4. Cost tier
        let mut cost_tier_relaxed = false;
        if let Some(tier) = criteria.cost_tier.as_deref() {
            let members = rules.cost_tier_membership.get(tier);
            let tiered: Vec<&str> = candidates
                .iter()
                .copied()
                .filter(|c| members.is_some_and(|m| m.iter().any(|id| id == c)))
                .collect();

            if tiered.is_empty() && !candidates.is_empty() {
                match self.cost_tier_mode {
                    CostTierMode::Advisory => {
                        tracing::debug!(tier, "Cost tier matched no candidate, ignoring tier");
                        cost_tier_relaxed = true;
                    }
                    CostTierMode::Strict => {
                        return self.default_backend(snapshot, SelectionReason::DefaultCostTier);
                    }
                }
            } else {
                candidates = tiered;
            }
        }

        // 5. Priority
        let best = candidates
            .iter()
            .filter_map(|c| snapshot.definition(c))
            .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));

        match best {
            Some(definition) => Some(Selection::new(
                definition.id.clone(),
                SelectionReason::Candidate {
                    remaining: candidates.len(),
                    cost_tier_relaxed,
                },
            )),
            None => self.default_backend(snapshot, SelectionReason::DefaultNoCandidates),
        }
    }

    fn default_backend(
        &self,
        snapshot: &RegistrySnapshot,
        reason: SelectionReason,
    ) -> Option<Selection> {
        let default = snapshot.rules().default_backend.as_deref();
        tracing::debug!(default = ?default, reason = %reason, "Falling back to default backend");
        default.map(|id| Selection::new(id, reason))
    }
}

fn is_excluded(preferences: Option<&CallerPreferences>, backend_id: &str) -> bool {
    preferences.is_some_and(|p| p.excludes(backend_id))
}

fn dedup_preserving_order(candidates: &mut Vec<&str>) {
    let mut seen = std::collections::HashSet::new();
    candidates.retain(|c| seen.insert(*c));
}

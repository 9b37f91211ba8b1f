//! Temporal identity smoothing.
//!
//! Per-frame classifications flicker: a face turned sideways is briefly
//! "unknown", a shadow makes Alice look like Bob for one frame, a person
//! stepping out of view drops out entirely. [`IdentitySmoother`] folds
//! those observations into a single tracked identity with a bounded
//! certainty score ("heat"):
//!
//! * frames that contain the tracked identity raise heat up to `heat_cap`;
//! * frames that lack it cool it down by `decay`, and the identity is
//!   dropped exactly when heat reaches zero;
//! * a different label has to win `switch_threshold` consecutive frames
//!   before it replaces the tracked identity.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NONE_LABEL;

const DEFAULT_HEAT_CAP: u32 = 5;
const DEFAULT_REWARD: u32 = 1;
const DEFAULT_DECAY: u32 = 1;
const DEFAULT_SWITCH_THRESHOLD: u32 = 3;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SmootherConfigError {
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("switch_threshold must be at least 2 to absorb single-frame noise, got {0}")]
    SwitchThresholdTooLow(u32),
    #[error("promotion heat ({promoted}) must exceed decay ({decay})")]
    PromotionHeatTooLow { promoted: u32, decay: u32 },
}

/// Tuning constants for [`IdentitySmoother`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmootherConfig {
    /// Maximum heat.
    pub heat_cap: u32,
    /// Heat gained per frame containing the tracked identity.
    pub reward: u32,
    /// Heat lost per frame without the tracked identity.
    pub decay: u32,
    /// Consecutive frames a challenger must win to be promoted.
    pub switch_threshold: u32,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            heat_cap: DEFAULT_HEAT_CAP,
            reward: DEFAULT_REWARD,
            decay: DEFAULT_DECAY,
            switch_threshold: DEFAULT_SWITCH_THRESHOLD,
        }
    }
}

impl SmootherConfig {
    pub fn validate(&self) -> Result<(), SmootherConfigError> {
        if self.heat_cap == 0 {
            return Err(SmootherConfigError::Zero("heat_cap"));
        }
        if self.reward == 0 {
            return Err(SmootherConfigError::Zero("reward"));
        }
        if self.decay == 0 {
            return Err(SmootherConfigError::Zero("decay"));
        }
        if self.switch_threshold < 2 {
            return Err(SmootherConfigError::SwitchThresholdTooLow(
                self.switch_threshold,
            ));
        }
        let promoted = self.promotion_heat();
        if promoted <= self.decay {
            return Err(SmootherConfigError::PromotionHeatTooLow {
                promoted,
                decay: self.decay,
            });
        }
        Ok(())
    }

    /// Heat a freshly promoted identity starts with.
    pub fn promotion_heat(&self) -> u32 {
        self.switch_threshold
            .saturating_mul(self.reward)
            .min(self.heat_cap)
    }

    /// Upper bound on the number of empty frames needed to drop any identity.
    pub fn decay_ticks(&self) -> u32 {
        self.heat_cap.div_ceil(self.decay)
    }
}

/// A label that has been winning frames while the leader was absent.
#[derive(Debug, Clone)]
struct Challenger {
    label: String,
    run: u32,
}

/// Debounced identity tracker. See the module docs for the policy.
#[derive(Debug, Clone)]
pub struct IdentitySmoother {
    config: SmootherConfig,
    heat: u32,
    leader: Option<String>,
    challenger: Option<Challenger>,
}

impl IdentitySmoother {
    pub fn new(config: SmootherConfig) -> Result<Self, SmootherConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            heat: 0,
            leader: None,
            challenger: None,
        })
    }

    pub fn config(&self) -> &SmootherConfig {
        &self.config
    }

    /// Forget all evidence. Called at the start of every detection session.
    pub fn reset(&mut self) {
        self.heat = 0;
        self.leader = None;
        self.challenger = None;
    }

    /// Current heat, in `0..=heat_cap`.
    pub fn current_value(&self) -> u32 {
        self.heat
    }

    /// Tracked identity, or `None` if nobody is tracked.
    pub fn current(&self) -> Option<&str> {
        self.leader.as_deref()
    }

    /// Tracked identity rendered for display (`"none"` when nobody is tracked).
    pub fn current_label(&self) -> &str {
        self.current().unwrap_or(NONE_LABEL)
    }

    /// Fold one frame's labels into the tracked state.
    ///
    /// `None` means no detection happened (no face found); an empty slice
    /// means zero faces. Both cool the tracked identity down.
    pub fn detect<S: AsRef<str>>(&mut self, labels: Option<&[S]>) {
        let labels = match labels {
            Some(labels) if !labels.is_empty() => labels,
            _ => {
                self.absent();
                return;
            }
        };

        if labels.iter().any(|l| l.as_ref().trim().is_empty()) {
            tracing::warn!(
                faces = labels.len(),
                "blank label in observation batch; treating frame as empty"
            );
            self.absent();
            return;
        }

        if let Some(leader) = &self.leader {
            if labels.iter().any(|l| l.as_ref() == leader) {
                self.heat = self
                    .heat
                    .saturating_add(self.config.reward)
                    .min(self.config.heat_cap);
                self.challenger = None;
                return;
            }
        }

        let candidate = most_frequent(labels);
        self.cool_leader();

        match &mut self.challenger {
            Some(c) if c.label == candidate => c.run += 1,
            slot => {
                *slot = Some(Challenger {
                    label: candidate.to_string(),
                    run: 1,
                })
            }
        }

        let run = self.challenger.as_ref().map_or(0, |c| c.run);
        if run >= self.config.switch_threshold {
            self.promote(candidate);
        }
    }

    /// Nobody (or nothing usable) in this frame.
    fn absent(&mut self) {
        self.challenger = None;
        self.cool_leader();
    }

    fn cool_leader(&mut self) {
        self.heat = self.heat.saturating_sub(self.config.decay);
        if self.heat == 0 {
            if let Some(previous) = self.leader.take() {
                tracing::info!(previous = %previous, "identity lost");
            }
        }
    }

    fn promote(&mut self, label: &str) {
        let previous = self.leader.replace(label.to_string());
        self.heat = self.config.promotion_heat();
        self.challenger = None;
        tracing::info!(
            previous = previous.as_deref().unwrap_or(NONE_LABEL),
            current = label,
            heat = self.heat,
            "identity changed"
        );
    }
}

/// Most frequent label in a non-empty batch; the first seen wins ties.
fn most_frequent<S: AsRef<str>>(labels: &[S]) -> &str {
    let mut best = labels[0].as_ref();
    let mut best_count = 0;
    for (i, label) in labels.iter().enumerate() {
        let label = label.as_ref();
        if labels[..i].iter().any(|l| l.as_ref() == label) {
            continue;
        }
        let count = labels.iter().filter(|l| l.as_ref() == label).count();
        if count > best_count {
            best = label;
            best_count = count;
        }
    }
    best
}

//! Node reputation tracking
//!
//! Every audit outcome updates a node's record:
//! - a Beta-style `(alpha, beta)` pair for audit success/failure
//! - a second pair for audits whose outcome could not be determined
//! - an audit history of fixed-size time windows that yields the online score
//!
//! Updates for one node are serialized on that node's mutex; different nodes
//! proceed concurrently.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::NodeId;
use thiserror::Error;
use tracing::{info, warn};

/// Reputation errors
#[derive(Error, Debug)]
pub enum ReputationError {
    #[error("Invalid reputation config: {0}")]
    InvalidConfig(String),

    #[error("Invalid audit history config: {0}")]
    InvalidHistoryConfig(String),
}

pub type Result<T> = std::result::Result<T, ReputationError>;

/// Outcome of auditing one piece on one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditOutcome {
    /// Node returned the piece and it verified
    Success,
    /// Node returned bad data or lost the piece
    Failure,
    /// Node answered but the result was inconclusive
    Unknown,
    /// Node could not be reached
    Offline,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Unknown => "unknown",
            Self::Offline => "offline",
        }
    }
}

/// Audit history window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditHistoryConfig {
    /// Width of each window
    pub window_size_secs: u64,
    /// Windows older than this are evicted
    pub tracking_period_secs: u64,
    /// New nodes are not offline-suspended before this much time has passed
    pub grace_period_secs: u64,
    /// Online score below this suspends the node
    pub offline_threshold: f64,
    pub offline_suspension_enabled: bool,
}

impl Default for AuditHistoryConfig {
    fn default() -> Self {
        Self {
            window_size_secs: 12 * 60 * 60,
            tracking_period_secs: 30 * 24 * 60 * 60,
            grace_period_secs: 7 * 24 * 60 * 60,
            offline_threshold: 0.6,
            offline_suspension_enabled: true,
        }
    }
}

impl AuditHistoryConfig {
    pub fn window_size(&self) -> Duration {
        Duration::from_secs(self.window_size_secs)
    }

    pub fn tracking_period(&self) -> Duration {
        Duration::from_secs(self.tracking_period_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size_secs == 0 {
            return Err(ReputationError::InvalidHistoryConfig(
                "window size must be > 0".to_string(),
            ));
        }
        if self.tracking_period_secs < self.window_size_secs {
            return Err(ReputationError::InvalidHistoryConfig(
                "tracking period shorter than one window".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.offline_threshold) {
            return Err(ReputationError::InvalidHistoryConfig(format!(
                "offline threshold {} outside [0, 1]",
                self.offline_threshold
            )));
        }
        Ok(())
    }
}

/// Scoring parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationConfig {
    pub initial_alpha: f64,
    pub initial_beta: f64,
    /// Forgetting factor for the audit pair
    pub audit_lambda: f64,
    pub audit_weight: f64,
    /// Audit score below this disqualifies the node permanently
    pub audit_dq: f64,
    /// Forgetting factor for the unknown-audit pair
    pub unknown_audit_lambda: f64,
    /// Unknown-audit score below this suspends the node
    pub unknown_audit_suspension: f64,
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            initial_alpha: 1000.0,
            initial_beta: 0.0,
            audit_lambda: 0.999,
            audit_weight: 1.0,
            audit_dq: 0.96,
            unknown_audit_lambda: 0.95,
            unknown_audit_suspension: 0.6,
        }
    }
}

impl ReputationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_alpha + self.initial_beta <= 0.0 {
            return Err(ReputationError::InvalidConfig(
                "initial alpha + beta must be > 0".to_string(),
            ));
        }
        for (name, lambda) in [
            ("audit_lambda", self.audit_lambda),
            ("unknown_audit_lambda", self.unknown_audit_lambda),
        ] {
            if !(0.0..=1.0).contains(&lambda) {
                return Err(ReputationError::InvalidConfig(format!(
                    "{} {} outside [0, 1]",
                    name, lambda
                )));
            }
        }
        if self.audit_weight <= 0.0 {
            return Err(ReputationError::InvalidConfig(
                "audit weight must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Audits seen in one time window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditWindow {
    pub window_start: DateTime<Utc>,
    pub total: u32,
    pub online: u32,
}

/// Sliding audit history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditHistory {
    pub windows: VecDeque<AuditWindow>,
    /// Mean online ratio over completed windows
    pub score: f64,
}

impl Default for AuditHistory {
    fn default() -> Self {
        Self {
            windows: VecDeque::new(),
            score: 1.0,
        }
    }
}

impl AuditHistory {
    fn add(&mut self, now: DateTime<Utc>, online: bool, config: &AuditHistoryConfig) {
        let window_start = window_start(now, config.window_size());

        match self.windows.back_mut() {
            Some(last) if last.window_start == window_start => {
                last.total += 1;
                last.online += u32::from(online);
            }
            _ => self.windows.push_back(AuditWindow {
                window_start,
                total: 1,
                online: u32::from(online),
            }),
        }

        let tracking = TimeDelta::from_std(config.tracking_period()).unwrap_or(TimeDelta::MAX);
        let cutoff = now.checked_sub_signed(tracking);
        while let (Some(first), Some(cutoff)) = (self.windows.front(), cutoff) {
            if first.window_start >= cutoff {
                break;
            }
            self.windows.pop_front();
        }

        self.score = self.compute_score(window_start);
    }

    /// Average per-window online ratio, ignoring the window still in progress
    fn compute_score(&self, current_window: DateTime<Utc>) -> f64 {
        let (sum, count) = self
            .windows
            .iter()
            .filter(|w| w.window_start < current_window && w.total > 0)
            .fold((0.0, 0u32), |(sum, count), w| {
                (sum + f64::from(w.online) / f64::from(w.total), count + 1)
            });
        if count == 0 {
            1.0
        } else {
            sum / f64::from(count)
        }
    }
}

fn window_start(now: DateTime<Utc>, window_size: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window_size)
        .ok()
        .and_then(|size| now.duration_trunc(size).ok())
        .unwrap_or(now)
}

/// Everything known about a node's audit behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReputation {
    pub node_id: NodeId,
    pub audit_success_count: u64,
    pub audit_failure_count: u64,
    pub audit_unknown_count: u64,
    pub offline_count: u64,
    pub total_audit_count: u64,
    pub audit_alpha: f64,
    pub audit_beta: f64,
    pub unknown_audit_alpha: f64,
    pub unknown_audit_beta: f64,
    pub audit_history: AuditHistory,
    pub first_audit: DateTime<Utc>,
    pub disqualified: Option<DateTime<Utc>>,
    pub unknown_audit_suspended: Option<DateTime<Utc>>,
    pub offline_suspended: Option<DateTime<Utc>>,
}

impl NodeReputation {
    /// Fresh record with the configured priors
    pub fn new(node_id: NodeId, now: DateTime<Utc>, config: &ReputationConfig) -> Self {
        Self {
            node_id,
            audit_success_count: 0,
            audit_failure_count: 0,
            audit_unknown_count: 0,
            offline_count: 0,
            total_audit_count: 0,
            audit_alpha: config.initial_alpha,
            audit_beta: config.initial_beta,
            unknown_audit_alpha: config.initial_alpha,
            unknown_audit_beta: config.initial_beta,
            audit_history: AuditHistory::default(),
            first_audit: now,
            disqualified: None,
            unknown_audit_suspended: None,
            offline_suspended: None,
        }
    }

    pub fn audit_score(&self) -> f64 {
        beta_score(self.audit_alpha, self.audit_beta)
    }

    pub fn unknown_audit_score(&self) -> f64 {
        beta_score(self.unknown_audit_alpha, self.unknown_audit_beta)
    }

    pub fn online_score(&self) -> f64 {
        self.audit_history.score
    }

    pub fn is_disqualified(&self) -> bool {
        self.disqualified.is_some()
    }

    pub fn is_suspended(&self) -> bool {
        self.unknown_audit_suspended.is_some() || self.offline_suspended.is_some()
    }

    /// Not disqualified and not suspended
    pub fn is_reliable(&self) -> bool {
        !self.is_disqualified() && !self.is_suspended()
    }

    /// Apply one outcome; returns whether the audit score or any status changed
    pub fn apply(
        &mut self,
        outcome: AuditOutcome,
        now: DateTime<Utc>,
        config: &ReputationConfig,
        history: &AuditHistoryConfig,
    ) -> bool {
        let before = (
            self.audit_score(),
            self.disqualified.is_some(),
            self.unknown_audit_suspended.is_some(),
            self.offline_suspended.is_some(),
        );

        self.total_audit_count += 1;
        match outcome {
            AuditOutcome::Success => {
                self.audit_success_count += 1;
                self.update_audit_pair(true, config);
                self.update_unknown_pair(true, config);
            }
            AuditOutcome::Failure => {
                self.audit_failure_count += 1;
                self.update_audit_pair(false, config);
                self.update_unknown_pair(true, config);
            }
            AuditOutcome::Unknown => {
                self.audit_unknown_count += 1;
                self.update_unknown_pair(false, config);
            }
            AuditOutcome::Offline => {
                self.offline_count += 1;
            }
        }
        self.audit_history
            .add(now, outcome != AuditOutcome::Offline, history);

        // Disqualification is permanent
        if self.disqualified.is_none() && self.audit_score() < config.audit_dq {
            self.disqualified = Some(now);
        }

        if self.unknown_audit_score() < config.unknown_audit_suspension {
            self.unknown_audit_suspended.get_or_insert(now);
        } else {
            self.unknown_audit_suspended = None;
        }

        let graced = TimeDelta::from_std(history.grace_period())
            .ok()
            .and_then(|grace| self.first_audit.checked_add_signed(grace))
            .is_some_and(|end| now >= end);
        if history.offline_suspension_enabled && graced {
            if self.online_score() < history.offline_threshold {
                self.offline_suspended.get_or_insert(now);
            } else {
                self.offline_suspended = None;
            }
        }

        let after = (
            self.audit_score(),
            self.disqualified.is_some(),
            self.unknown_audit_suspended.is_some(),
            self.offline_suspended.is_some(),
        );
        before != after
    }

    fn update_audit_pair(&mut self, success: bool, config: &ReputationConfig) {
        let v = if success { 1.0 } else { 0.0 };
        self.audit_alpha = config.audit_lambda * self.audit_alpha + config.audit_weight * v;
        self.audit_beta = config.audit_lambda * self.audit_beta + config.audit_weight * (1.0 - v);
    }

    fn update_unknown_pair(&mut self, success: bool, config: &ReputationConfig) {
        let v = if success { 1.0 } else { 0.0 };
        self.unknown_audit_alpha =
            config.unknown_audit_lambda * self.unknown_audit_alpha + config.audit_weight * v;
        self.unknown_audit_beta =
            config.unknown_audit_lambda * self.unknown_audit_beta + config.audit_weight * (1.0 - v);
    }
}

fn beta_score(alpha: f64, beta: f64) -> f64 {
    if alpha + beta <= 0.0 {
        1.0
    } else {
        alpha / (alpha + beta)
    }
}

/// In-memory reputation store
pub struct ReputationTracker {
    config: ReputationConfig,
    records: RwLock<HashMap<NodeId, Arc<Mutex<NodeReputation>>>>,
}

impl ReputationTracker {
    pub fn new(config: ReputationConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            records: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ReputationConfig {
        &self.config
    }

    /// Apply one audit outcome to a node, creating its record on first use
    ///
    /// Returns the updated record and whether the audit score or a status
    /// flag changed.
    pub fn update(
        &self,
        node_id: NodeId,
        outcome: AuditOutcome,
        now: DateTime<Utc>,
        history: &AuditHistoryConfig,
    ) -> Result<(NodeReputation, bool)> {
        history.validate()?;

        let record = self.record(node_id, now);
        let mut record = record.lock();
        let was_disqualified = record.is_disqualified();
        let was_suspended = record.is_suspended();

        let changed = record.apply(outcome, now, &self.config, history);

        counter!("reputation_updates_total", "outcome" => outcome.as_str()).increment(1);
        if !was_disqualified && record.is_disqualified() {
            warn!(node = %node_id, score = record.audit_score(), "Node disqualified");
            counter!("reputation_disqualifications_total").increment(1);
        }
        if was_suspended != record.is_suspended() {
            info!(
                node = %node_id,
                suspended = record.is_suspended(),
                unknown_score = record.unknown_audit_score(),
                online_score = record.online_score(),
                "Node suspension changed"
            );
        }

        Ok((record.clone(), changed))
    }

    /// Snapshot of a node's record
    pub fn get(&self, node_id: &NodeId) -> Option<NodeReputation> {
        let records = self.records.read();
        records.get(node_id).map(|r| r.lock().clone())
    }

    /// Audit score, or the prior score for nodes never audited
    pub fn audit_score(&self, node_id: &NodeId) -> f64 {
        self.get(node_id)
            .map(|r| r.audit_score())
            .unwrap_or_else(|| beta_score(self.config.initial_alpha, self.config.initial_beta))
    }

    /// Whether a node is neither disqualified nor suspended (unknown nodes are reliable)
    pub fn is_reliable(&self, node_id: &NodeId) -> bool {
        self.get(node_id).map_or(true, |r| r.is_reliable())
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get or create the per-node record
    fn record(&self, node_id: NodeId, now: DateTime<Utc>) -> Arc<Mutex<NodeReputation>> {
        if let Some(record) = self.records.read().get(&node_id) {
            return record.clone();
        }
        self.records
            .write()
            .entry(node_id)
            .or_insert_with(|| Arc::new(Mutex::new(NodeReputation::new(node_id, now, &self.config))))
            .clone()
    }
}

//! Sliding-window rate limiting for every protocol entry point.
//!
//! Three independent scopes are evaluated on each check: global, per
//! device, and per (device, action). An explicit device block is checked
//! before any window. Denied attempts are not recorded, so hammering a
//! saturated scope does not push its reset time further out.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::CoreError;

pub const ACTION_PAIRING_INITIATE: &str = "pairing.initiate";
pub const ACTION_PAIRING_JOIN: &str = "pairing.join";
pub const ACTION_PAIRING_ACCEPT: &str = "pairing.accept";
pub const ACTION_PAIRING_VERIFY: &str = "pairing.verify";
pub const ACTION_PAIRING_CONFIRM: &str = "pairing.confirm";
/// Failed PIN comparisons, counted per peer device.
pub const ACTION_PAIRING_PIN: &str = "pairing.pin";

/// `max_requests` per sliding `window`. Saturating a rule with a
/// `block_duration` also blocks the device for that long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateRule {
    pub max_requests: u32,
    pub window: Duration,
    pub block_duration: Option<Duration>,
}

impl RateRule {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            block_duration: None,
        }
    }

    pub fn with_block(mut self, block_duration: Duration) -> Self {
        self.block_duration = Some(block_duration);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub global: Option<RateRule>,
    pub device: Option<RateRule>,
    pub actions: HashMap<String, RateRule>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let minute = Duration::from_secs(60);
        let mut actions = HashMap::new();
        actions.insert(ACTION_PAIRING_INITIATE.to_string(), RateRule::new(10, minute));
        actions.insert(ACTION_PAIRING_JOIN.to_string(), RateRule::new(10, minute));
        actions.insert(ACTION_PAIRING_ACCEPT.to_string(), RateRule::new(10, minute));
        actions.insert(ACTION_PAIRING_VERIFY.to_string(), RateRule::new(20, minute));
        actions.insert(ACTION_PAIRING_CONFIRM.to_string(), RateRule::new(20, minute));
        Self {
            global: Some(RateRule::new(1000, minute)),
            device: Some(RateRule::new(120, minute)),
            actions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RateScope {
    Global,
    Device(String),
    DeviceAction(String, String),
}

impl fmt::Display for RateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateScope::Global => f.write_str("global"),
            RateScope::Device(id) => write!(f, "device {id}"),
            RateScope::DeviceAction(id, action) => write!(f, "device {id} action {action}"),
        }
    }
}

/// Outcome of a limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    /// When the denying scope frees up again.
    pub reset_at: Option<Instant>,
    pub retry_after: Duration,
    /// Budget left under the tightest applicable rule.
    pub remaining: u32,
}

impl RateDecision {
    fn allow(remaining: u32) -> Self {
        Self {
            allowed: true,
            reason: None,
            reset_at: None,
            retry_after: Duration::ZERO,
            remaining,
        }
    }

    fn deny(reason: String, reset_at: Instant, now: Instant) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            reset_at: Some(reset_at),
            retry_after: reset_at.saturating_duration_since(now),
            remaining: 0,
        }
    }

    /// Convert a denial into [`CoreError::RateLimitExceeded`].
    pub fn into_result(self) -> Result<RateDecision, CoreError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(CoreError::RateLimitExceeded {
                reason: self.reason.unwrap_or_else(|| "rate limited".into()),
                retry_after: self.retry_after,
            })
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitStats {
    pub tracked_devices: usize,
    pub tracked_actions: usize,
    pub blocked_devices: usize,
    pub global_requests_in_window: usize,
    pub total_checks: u64,
    pub total_denied: u64,
    pub total_recorded: u64,
}

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Default)]
struct RateRecord {
    requests: Vec<Instant>,
}

impl RateRecord {
    /// Drop instants at or before `now - window`.
    fn prune(&mut self, window: Duration, now: Instant) {
        if let Some(cutoff) = now.checked_sub(window) {
            self.requests.retain(|&t| t > cutoff);
        }
    }

    fn oldest(&self) -> Option<Instant> {
        self.requests.iter().min().copied()
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    global: RateRecord,
    devices: HashMap<String, RateRecord>,
    actions: HashMap<(String, String), RateRecord>,
    blocks: HashMap<String, Instant>,
    total_checks: u64,
    total_denied: u64,
    total_recorded: u64,
}

enum Verdict {
    Ok { remaining: u32 },
    Saturated { reset_at: Instant },
}

fn apply_rule(record: &mut RateRecord, rule: &RateRule, now: Instant) -> Verdict {
    record.prune(rule.window, now);
    let count = record.requests.len() as u32;
    if count >= rule.max_requests {
        let reset_at = record.oldest().map_or(now, |t| t + rule.window);
        Verdict::Saturated { reset_at }
    } else {
        Verdict::Ok {
            remaining: rule.max_requests - count,
        }
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

pub struct RateLimiter {
    config: RateLimitConfig,
    state: RwLock<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: RwLock::new(LimiterState::default()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn rules_for(&self, device_id: &str, action: Option<&str>) -> Vec<(RateScope, RateRule)> {
        let mut rules = Vec::with_capacity(3);
        if let Some(rule) = self.config.global {
            rules.push((RateScope::Global, rule));
        }
        if let Some(rule) = self.config.device {
            rules.push((RateScope::Device(device_id.to_string()), rule));
        }
        if let Some(action) = action {
            if let Some(rule) = self.config.actions.get(action) {
                rules.push((
                    RateScope::DeviceAction(device_id.to_string(), action.to_string()),
                    *rule,
                ));
            }
        }
        rules
    }

    fn record_for<'a>(state: &'a mut LimiterState, scope: &RateScope) -> &'a mut RateRecord {
        match scope {
            RateScope::Global => &mut state.global,
            RateScope::Device(id) => state.devices.entry(id.clone()).or_default(),
            RateScope::DeviceAction(id, action) => state
                .actions
                .entry((id.clone(), action.clone()))
                .or_default(),
        }
    }

    /// Active block check; expired blocks are dropped on the way.
    fn active_block(state: &mut LimiterState, device_id: &str, now: Instant) -> Option<Instant> {
        match state.blocks.get(device_id).copied() {
            Some(until) if until > now => Some(until),
            Some(_) => {
                state.blocks.remove(device_id);
                None
            }
            None => None,
        }
    }

    fn evaluate(
        &self,
        state: &mut LimiterState,
        rules: &[(RateScope, RateRule)],
        device_id: &str,
        now: Instant,
    ) -> RateDecision {
        state.total_checks += 1;

        if let Some(until) = Self::active_block(state, device_id, now) {
            state.total_denied += 1;
            return RateDecision::deny(format!("device {device_id} is blocked"), until, now);
        }

        let mut remaining = u32::MAX;
        let mut denial: Option<(RateScope, RateRule, Instant)> = None;
        for (scope, rule) in rules {
            let record = Self::record_for(state, scope);
            match apply_rule(record, rule, now) {
                Verdict::Ok { remaining: left } => remaining = remaining.min(left),
                Verdict::Saturated { reset_at } => {
                    let later = denial.as_ref().map_or(true, |(_, _, r)| reset_at > *r);
                    if later {
                        denial = Some((scope.clone(), *rule, reset_at));
                    }
                }
            }
        }

        let Some((scope, rule, mut reset_at)) = denial else {
            return RateDecision::allow(remaining);
        };

        state.total_denied += 1;
        let mut reason = format!("{scope} exceeded {} requests per {:?}", rule.max_requests, rule.window);
        if let Some(block) = rule.block_duration {
            let until = now + block;
            state.blocks.insert(device_id.to_string(), until);
            reset_at = reset_at.max(until);
            reason.push_str(&format!("; blocked for {:?}", block));
            warn!(device_id = %device_id, scope = %scope, block_ms = block.as_millis() as u64, "Rate limit block installed");
        } else {
            warn!(device_id = %device_id, scope = %scope, "Rate limit exceeded");
        }
        RateDecision::deny(reason, reset_at, now)
    }

    fn record(&self, state: &mut LimiterState, rules: &[(RateScope, RateRule)], now: Instant) {
        for (scope, _) in rules {
            Self::record_for(state, scope).requests.push(now);
        }
        state.total_recorded += 1;
    }

    // -------------------------------------------------------------------------
    // Checks and recording
    // -------------------------------------------------------------------------

    pub async fn check_limit(&self, device_id: &str, action: Option<&str>) -> RateDecision {
        self.check_limit_at(device_id, action, Instant::now()).await
    }

    pub async fn check_limit_at(
        &self,
        device_id: &str,
        action: Option<&str>,
        now: Instant,
    ) -> RateDecision {
        let rules = self.rules_for(device_id, action);
        let mut state = self.state.write().await;
        self.evaluate(&mut state, &rules, device_id, now)
    }

    /// Check only the (device, action) scope plus any explicit block.
    pub async fn check_action_at(&self, device_id: &str, action: &str, now: Instant) -> RateDecision {
        let rules: Vec<_> = self
            .rules_for(device_id, Some(action))
            .into_iter()
            .filter(|(scope, _)| matches!(scope, RateScope::DeviceAction(..)))
            .collect();
        let mut state = self.state.write().await;
        self.evaluate(&mut state, &rules, device_id, now)
    }

    /// Record into the (device, action) scope only.
    pub async fn record_action_at(&self, device_id: &str, action: &str, now: Instant) {
        let rules: Vec<_> = self
            .rules_for(device_id, Some(action))
            .into_iter()
            .filter(|(scope, _)| matches!(scope, RateScope::DeviceAction(..)))
            .collect();
        let mut state = self.state.write().await;
        self.record(&mut state, &rules, now);
    }

    pub async fn record_request(&self, device_id: &str, action: Option<&str>) {
        self.record_request_at(device_id, action, Instant::now()).await
    }

    pub async fn record_request_at(&self, device_id: &str, action: Option<&str>, now: Instant) {
        let rules = self.rules_for(device_id, action);
        let mut state = self.state.write().await;
        self.record(&mut state, &rules, now);
    }

    /// Check and, if allowed, record in one step.
    pub async fn admit(&self, device_id: &str, action: Option<&str>) -> RateDecision {
        self.admit_at(device_id, action, Instant::now()).await
    }

    pub async fn admit_at(&self, device_id: &str, action: Option<&str>, now: Instant) -> RateDecision {
        let rules = self.rules_for(device_id, action);
        let mut state = self.state.write().await;
        let mut decision = self.evaluate(&mut state, &rules, device_id, now);
        if decision.allowed {
            self.record(&mut state, &rules, now);
            decision.remaining = decision.remaining.saturating_sub(1);
        }
        decision
    }

    // -------------------------------------------------------------------------
    // Blocks
    // -------------------------------------------------------------------------

    pub async fn block_device(&self, device_id: &str, duration: Duration) {
        self.block_device_at(device_id, duration, Instant::now()).await
    }

    pub async fn block_device_at(&self, device_id: &str, duration: Duration, now: Instant) {
        let until = now + duration;
        let mut state = self.state.write().await;
        let entry = state.blocks.entry(device_id.to_string()).or_insert(until);
        *entry = (*entry).max(until);
        info!(device_id = %device_id, duration_ms = duration.as_millis() as u64, "Device blocked");
    }

    pub async fn unblock_device(&self, device_id: &str) {
        if self.state.write().await.blocks.remove(device_id).is_some() {
            info!(device_id = %device_id, "Device unblocked");
        }
    }

    pub async fn is_blocked(&self, device_id: &str) -> bool {
        self.is_blocked_at(device_id, Instant::now()).await
    }

    pub async fn is_blocked_at(&self, device_id: &str, now: Instant) -> bool {
        self.state
            .read()
            .await
            .blocks
            .get(device_id)
            .is_some_and(|until| *until > now)
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Forget every record and block for a device.
    pub async fn reset_device(&self, device_id: &str) {
        let mut state = self.state.write().await;
        state.devices.remove(device_id);
        state.actions.retain(|(id, _), _| id != device_id);
        state.blocks.remove(device_id);
        debug!(device_id = %device_id, "Rate limit records reset");
    }

    pub async fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now()).await
    }

    /// Prune every record and drop the ones left empty along with expired
    /// blocks. Returns how many entries were dropped.
    pub async fn cleanup_at(&self, now: Instant) -> usize {
        let mut state = self.state.write().await;
        let state = &mut *state;
        let before = state.devices.len() + state.actions.len() + state.blocks.len();

        if let Some(rule) = self.config.global {
            state.global.prune(rule.window, now);
        }
        match self.config.device {
            Some(rule) => {
                state.devices.retain(|_, record| {
                    record.prune(rule.window, now);
                    !record.requests.is_empty()
                });
            }
            None => state.devices.clear(),
        }
        let actions = &self.config.actions;
        state.actions.retain(|(_, action), record| match actions.get(action) {
            Some(rule) => {
                record.prune(rule.window, now);
                !record.requests.is_empty()
            }
            None => false,
        });
        state.blocks.retain(|_, until| *until > now);

        let removed = before - (state.devices.len() + state.actions.len() + state.blocks.len());
        if removed > 0 {
            debug!(removed, "Rate limit records cleaned up");
        }
        removed
    }

    pub async fn get_statistics(&self) -> RateLimitStats {
        let state = self.state.read().await;
        let now = Instant::now();
        let global_requests_in_window =
            match self.config.global.and_then(|rule| now.checked_sub(rule.window)) {
                Some(cutoff) => state.global.requests.iter().filter(|&&t| t > cutoff).count(),
                None => state.global.requests.len(),
            };
        RateLimitStats {
            tracked_devices: state.devices.len(),
            tracked_actions: state.actions.len(),
            blocked_devices: state.blocks.values().filter(|&&until| until > now).count(),
            global_requests_in_window,
            total_checks: state.total_checks,
            total_denied: state.total_denied,
            total_recorded: state.total_recorded,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

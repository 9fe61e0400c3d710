// src/core/instance.rs

//! A single back-end instance behind a front service.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::descriptor::Descriptor;
use crate::core::errors::OnionBalanceError;
use crate::core::health::{Health, HealthCheck, ProbeOutcome};
use crate::core::introduction_point::IntroductionPoint;

/// One back-end instance: an onion service whose introduction points get
/// aggregated, along with the manager's last-known view of it.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Onion address of this instance, without the `.onion` suffix.
    pub onion_address: String,
    /// Decrypts this instance's introduction-point list when its descriptor
    /// was published under `basic auth`, per spec.md's Data Model.
    pub auth_cookie: Option<[u8; 16]>,
    pub introduction_points: Vec<IntroductionPoint>,
    /// When the manager last received a descriptor event for this instance.
    pub received: Option<DateTime<Utc>>,
    /// `published` field of the last descriptor actually applied (used to
    /// reject stale, out-of-order deliveries).
    pub timestamp: Option<DateTime<Utc>>,
    pub changed_since_published: bool,
    pub health: Health,
    /// Set when `health` differs from its value on the previous check;
    /// cleared by the service once it has been read.
    pub health_changed: bool,
    pub last_probe: Option<ProbeOutcome>,
}

impl Instance {
    pub fn new(onion_address: impl Into<String>) -> Self {
        Self {
            onion_address: onion_address.into(),
            auth_cookie: None,
            introduction_points: Vec::new(),
            received: None,
            timestamp: None,
            changed_since_published: false,
            health: Health::Unknown,
            health_changed: false,
            last_probe: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_up()
    }

    /// Whether this instance's descriptor data is fresh enough to include in
    /// an aggregate descriptor: `received` must be within `upload_period` of
    /// now and `timestamp` must be within `max_descriptor_age` of now — two
    /// distinct bounds, per spec.md §4.4 step 1.
    pub fn is_descriptor_fresh(&self, upload_period: Duration, max_descriptor_age: Duration) -> bool {
        let upload_period = ChronoDuration::from_std(upload_period).unwrap_or(ChronoDuration::MAX);
        let max_descriptor_age = ChronoDuration::from_std(max_descriptor_age).unwrap_or(ChronoDuration::MAX);
        let now = Utc::now();
        match (self.received, self.timestamp) {
            (Some(received), Some(timestamp)) => now - received <= upload_period && now - timestamp <= max_descriptor_age,
            _ => false,
        }
    }

    /// Applies a freshly-fetched descriptor, rejecting it if it is not newer
    /// than the one currently held (replay / reordering protection).
    ///
    /// Returns `Ok(true)` if the introduction-point set changed as a result.
    pub fn update(&mut self, parsed: Descriptor) -> Result<bool, OnionBalanceError> {
        self.received = Some(Utc::now());

        if let Some(current) = self.timestamp
            && parsed.published <= current
        {
            warn!(
                onion_address = %self.onion_address,
                "rejecting stale descriptor (published {} <= current {})",
                parsed.published, current
            );
            return Err(OnionBalanceError::DescriptorStale);
        }

        self.timestamp = Some(parsed.published);

        let incoming_points = parsed.introduction_points(self.auth_cookie.as_ref())?;

        let previous: HashSet<&str> = self.introduction_points.iter().map(|p| p.identifier.as_str()).collect();
        let incoming: HashSet<&str> = incoming_points.iter().map(|p| p.identifier.as_str()).collect();
        let changed = previous != incoming;

        if changed {
            debug!(
                onion_address = %self.onion_address,
                previous = previous.len(),
                incoming = incoming.len(),
                "introduction points changed"
            );
            self.introduction_points = incoming_points;
            self.changed_since_published = true;
        }

        Ok(changed)
    }

    /// Records the outcome of a health probe, flipping `health_changed` only
    /// on an edge (healthy -> unhealthy or vice versa).
    pub fn record_probe(&mut self, check: &HealthCheck, outcome: ProbeOutcome) {
        let new_health = if check.is_none() || outcome.healthy { Health::Up } else { Health::Down };
        if new_health != self.health {
            self.health_changed = true;
        }
        self.health = new_health;
        self.last_probe = Some(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn descriptor_at(ts: i64, points: &[&str]) -> Descriptor {
        // `Descriptor::plain` re-derives each point's identifier from its raw
        // body, so distinct logical points need distinct bodies here.
        let points: Vec<IntroductionPoint> = points.iter().map(|id| IntroductionPoint::new(*id, id.as_bytes())).collect();
        Descriptor::plain(Utc.timestamp_opt(ts, 0).single().unwrap(), &points)
    }

    #[test]
    fn first_update_is_always_applied() {
        let mut instance = Instance::new("abc");
        let changed = instance.update(descriptor_at(1000, &["a", "b"])).unwrap();
        assert!(changed);
        assert_eq!(instance.introduction_points.len(), 2);
        assert!(instance.changed_since_published);
    }

    #[test]
    fn stale_descriptor_is_rejected_and_state_unchanged() {
        let mut instance = Instance::new("abc");
        instance.update(descriptor_at(1000, &["a"])).unwrap();
        instance.changed_since_published = false;

        let err = instance.update(descriptor_at(999, &["a", "b"])).unwrap_err();
        assert!(matches!(err, OnionBalanceError::DescriptorStale));
        assert_eq!(instance.introduction_points.len(), 1);
        assert!(!instance.changed_since_published);
    }

    #[test]
    fn equal_timestamp_descriptor_is_rejected() {
        let mut instance = Instance::new("abc");
        instance.update(descriptor_at(1000, &["a"])).unwrap();
        let err = instance.update(descriptor_at(1000, &["a", "b"])).unwrap_err();
        assert!(matches!(err, OnionBalanceError::DescriptorStale));
    }

    #[test]
    fn unchanged_intro_point_set_does_not_set_changed_flag() {
        let mut instance = Instance::new("abc");
        instance.update(descriptor_at(1000, &["a", "b"])).unwrap();
        instance.changed_since_published = false;

        let changed = instance.update(descriptor_at(2000, &["b", "a"])).unwrap();
        assert!(!changed);
        assert!(!instance.changed_since_published);
    }

    #[test]
    fn is_descriptor_fresh_applies_upload_period_and_max_age_separately() {
        let mut instance = Instance::new("abc");
        let two_hours_ago = Utc::now() - ChronoDuration::hours(2);
        instance.received = Some(two_hours_ago);
        instance.timestamp = Some(two_hours_ago);

        // Within both a 3h upload period and the 4h max age.
        assert!(instance.is_descriptor_fresh(Duration::from_secs(3 * 3600), Duration::from_secs(4 * 3600)));

        // Past the 1h upload period even though still within the 4h max age.
        assert!(!instance.is_descriptor_fresh(Duration::from_secs(3600), Duration::from_secs(4 * 3600)));
    }

    #[test]
    fn health_changed_flag_is_edge_triggered() {
        let check = HealthCheck::Tcp { port: 80, timeout: Duration::from_secs(1) };
        let mut instance = Instance::new("abc");
        let outcome = ProbeOutcome { healthy: true, start: Utc::now(), elapsed: Duration::from_millis(1) };

        instance.record_probe(&check, outcome);
        assert!(instance.health_changed);
        instance.health_changed = false;

        instance.record_probe(&check, outcome);
        assert!(!instance.health_changed, "no state change should not re-set the flag");

        let down = ProbeOutcome { healthy: false, ..outcome };
        instance.record_probe(&check, down);
        assert!(instance.health_changed);
    }

    #[test]
    fn none_check_is_always_healthy_regardless_of_probe_result() {
        let check = HealthCheck::None;
        let mut instance = Instance::new("abc");
        let outcome = ProbeOutcome { healthy: false, start: Utc::now(), elapsed: Duration::from_millis(1) };
        instance.record_probe(&check, outcome);
        assert!(instance.is_healthy());
    }
}

// src/core/service.rs

//! A front service: the RSA key pair instances publish behind, plus the
//! policy for deciding which instances' introduction points get aggregated
//! and when the resulting descriptor needs to be republished.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::descriptor::{self, ServiceKey};
use crate::core::errors::OnionBalanceError;
use crate::core::health::HealthCheck;
use crate::core::instance::Instance;
use crate::core::introduction_point::IntroductionPoint;

/// How a service picks which instances serve traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionMode {
    /// All healthy, fresh instances are included every cycle.
    RoundRobin,
    /// Only one instance's introduction points are published at a time;
    /// the manager fails over to the next eligible instance only when the
    /// current preferred instance drops out.
    ActiveStandby,
}

/// A descriptor has not changed its identity for this long before the
/// manager considers it overdue for a republish, independent of any other
/// trigger. Mirrors the fixed `max_descriptor_age` the reference
/// implementation never made configurable.
const MAX_DESCRIPTOR_AGE: Duration = Duration::from_secs(4 * 60 * 60);

/// Cadence at which the underlying descriptor-ID rotation period repeats.
/// Real Tor derives this from the consensus; the manager uses the
/// configured validity period as a stand-in, which is sufficient to decide
/// "are we near a rotation boundary" without speaking full consensus
/// parsing.
pub struct RotationParams {
    pub validity_period: Duration,
    pub overlap_period: Duration,
}

pub struct Service {
    pub service_key: ServiceKey,
    pub instances: Vec<Instance>,
    pub health_check: HealthCheck,
    pub mode: SelectionMode,
    pub uploaded: Option<DateTime<Utc>>,
    preferred_active_instance: Option<String>,
}

impl Service {
    pub fn new(service_key: ServiceKey, instances: Vec<Instance>, health_check: HealthCheck, mode: SelectionMode) -> Self {
        Self {
            service_key,
            instances,
            health_check,
            mode,
            uploaded: None,
            preferred_active_instance: None,
        }
    }

    pub fn onion_address(&self) -> &str {
        &self.service_key.onion_address
    }

    fn intro_points_modified(&self) -> bool {
        self.instances.iter().any(|i| i.changed_since_published)
    }

    /// Edge-triggered: returns whether any instance's health flipped since
    /// the last call, clearing the flag on every instance it reads.
    fn instances_health_has_changed(&mut self) -> bool {
        let mut changed = false;
        for instance in &mut self.instances {
            if instance.health_changed {
                changed = true;
                instance.health_changed = false;
            }
        }
        changed
    }

    fn descriptor_not_uploaded_recently(&self, upload_period: Duration) -> bool {
        match self.uploaded {
            None => true,
            Some(uploaded) => {
                let age = Utc::now().signed_duration_since(uploaded);
                age > chrono::Duration::from_std(upload_period).unwrap_or(chrono::Duration::MAX)
            }
        }
    }

    /// Seconds remaining before the descriptor ID this service publishes
    /// under will rotate to the next period.
    fn seconds_until_id_rotation(&self, validity_period: Duration) -> Duration {
        let period = validity_period.as_secs().max(1);
        let now = Utc::now().timestamp().max(0) as u64;
        Duration::from_secs(period - (now % period))
    }

    fn descriptor_id_changing_soon(&self, rotation: &RotationParams) -> bool {
        self.seconds_until_id_rotation(rotation.validity_period) < rotation.overlap_period
    }

    /// Selects the instances eligible to contribute introduction points this
    /// cycle, applying the round-robin or active-standby policy, and clears
    /// `changed_since_published` on each one selected.
    fn select_instances(&mut self, upload_period: Duration) -> Vec<usize> {
        let mut eligible = Vec::new();
        for (idx, instance) in self.instances.iter().enumerate() {
            if instance.received.is_none() || instance.timestamp.is_none() {
                continue;
            }
            if !instance.is_healthy() {
                continue;
            }
            if !instance.is_descriptor_fresh(upload_period, MAX_DESCRIPTOR_AGE) {
                continue;
            }
            eligible.push(idx);
        }

        let selected = match self.mode {
            SelectionMode::RoundRobin => eligible,
            SelectionMode::ActiveStandby => self.apply_active_standby(eligible),
        };

        for &idx in &selected {
            self.instances[idx].changed_since_published = false;
        }

        selected
    }

    /// Active-standby failover: sticks with the current preferred instance
    /// as long as it remains eligible; otherwise promotes the first eligible
    /// instance in configured order.
    fn apply_active_standby(&mut self, eligible: Vec<usize>) -> Vec<usize> {
        if eligible.is_empty() {
            return eligible;
        }

        let still_preferred = self
            .preferred_active_instance
            .as_deref()
            .and_then(|addr| eligible.iter().copied().find(|&idx| self.instances[idx].onion_address == addr));

        let chosen = match still_preferred {
            Some(idx) => idx,
            None => {
                let idx = eligible[0];
                if self.preferred_active_instance.is_some() {
                    info!(
                        onion_address = %self.instances[idx].onion_address,
                        "active-standby failover: promoting new preferred instance"
                    );
                }
                self.preferred_active_instance = Some(self.instances[idx].onion_address.clone());
                idx
            }
        };

        vec![chosen]
    }

    /// Builds one aggregate descriptor for the given replica index (0-based)
    /// and rotation deviation (0 or 1), out of the intro-point pools already
    /// selected for this publish cycle.
    fn generate_one(
        &self,
        pools: &[Vec<IntroductionPoint>],
        max_intro_points: usize,
        replica: u8,
        deviation: u8,
    ) -> Result<Vec<u8>, OnionBalanceError> {
        let chosen = descriptor::choose(pools, max_intro_points);

        debug!(
            onion_address = %self.onion_address(),
            replica,
            deviation,
            intro_points = chosen.len(),
            "generating descriptor"
        );

        descriptor::generate(&self.service_key, &chosen, replica, deviation, Utc::now())
    }

    /// Decides whether the descriptor needs publishing this cycle and, if
    /// so, generates and returns one aggregate descriptor per
    /// `replica in [0, replicas)` (and a second one per replica with
    /// `deviation = 1` if a rotation boundary is near). The caller is
    /// responsible for actually posting the returned blobs to the control
    /// channel and for recording the result via [`Service::mark_uploaded`].
    pub fn descriptor_publish(
        &mut self,
        max_intro_points: usize,
        upload_period: Duration,
        replicas: usize,
        rotation: &RotationParams,
        force: bool,
    ) -> Result<Vec<Vec<u8>>, OnionBalanceError> {
        let should_publish =
            force || self.intro_points_modified() || self.descriptor_not_uploaded_recently(upload_period) || self.instances_health_has_changed();

        if !should_publish {
            return Ok(Vec::new());
        }

        let selected = self.select_instances(upload_period);
        let pools: Vec<_> = selected.iter().map(|&idx| self.instances[idx].introduction_points.clone()).collect();
        let overlap = self.descriptor_id_changing_soon(rotation);

        let mut blobs = Vec::with_capacity(replicas * if overlap { 2 } else { 1 });
        for replica in 0..replicas {
            let replica = replica as u8;
            let mut deviations = vec![0u8];
            if overlap {
                deviations.push(1);
            }
            for deviation in deviations {
                match self.generate_one(&pools, max_intro_points, replica, deviation) {
                    Ok(blob) => blobs.push(blob),
                    Err(e) => warn!(
                        onion_address = %self.onion_address(),
                        replica, deviation, "descriptor generation failed: {}", e
                    ),
                }
            }
        }

        Ok(blobs)
    }

    /// Records that an upload attempt was made, regardless of whether every
    /// replica post actually succeeded: the control channel does not report
    /// per-service upload outcomes, so the manager tracks "an attempt was
    /// made" rather than "an attempt succeeded".
    pub fn mark_uploaded(&mut self) {
        self.uploaded = Some(Utc::now());
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("onion_address", &self.onion_address())
            .field("instances", &self.instances.len())
            .field("mode", &self.mode)
            .field("uploaded", &self.uploaded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::ServiceKey;
    use rand::rngs::OsRng;
    use rsa::RsaPrivateKey;

    fn test_service_key() -> ServiceKey {
        ServiceKey::from_private_key(RsaPrivateKey::new(&mut OsRng, 2048).unwrap()).unwrap()
    }

    fn ready_instance(addr: &str) -> Instance {
        let mut instance = Instance::new(addr);
        instance.received = Some(Utc::now());
        instance.timestamp = Some(Utc::now());
        instance.health = crate::core::health::Health::Up;
        instance.introduction_points = vec![IntroductionPoint::new("ip1", &b"body"[..])];
        instance
    }

    fn rotation() -> RotationParams {
        RotationParams {
            validity_period: Duration::from_secs(86400),
            overlap_period: Duration::from_secs(3600),
        }
    }

    #[test]
    fn publishes_on_force_even_with_no_changes() {
        let mut svc = Service::new(test_service_key(), vec![ready_instance("a")], HealthCheck::None, SelectionMode::RoundRobin);
        let blobs = svc.descriptor_publish(10, Duration::from_secs(3600), 1, &rotation(), true).unwrap();
        assert_eq!(blobs.len(), 1);
    }

    #[test]
    fn does_not_publish_when_nothing_changed_and_recently_uploaded() {
        let mut svc = Service::new(test_service_key(), vec![ready_instance("a")], HealthCheck::None, SelectionMode::RoundRobin);
        svc.mark_uploaded();
        svc.instances[0].changed_since_published = false;
        let blobs = svc.descriptor_publish(10, Duration::from_secs(3600), 1, &rotation(), false).unwrap();
        assert!(blobs.is_empty());
    }

    #[test]
    fn publishes_one_descriptor_per_replica() {
        let mut svc = Service::new(test_service_key(), vec![ready_instance("a")], HealthCheck::None, SelectionMode::RoundRobin);
        let blobs = svc.descriptor_publish(10, Duration::from_secs(3600), 2, &rotation(), true).unwrap();
        assert_eq!(blobs.len(), 2, "one descriptor per configured replica");
    }

    #[test]
    fn overlap_period_doubles_posts_per_replica() {
        // A validity period shorter than the overlap period means the
        // rotation boundary is always judged to be near, per
        // `descriptor_id_changing_soon`.
        let mut svc = Service::new(test_service_key(), vec![ready_instance("a")], HealthCheck::None, SelectionMode::RoundRobin);
        let near_rotation = RotationParams {
            validity_period: Duration::from_secs(1),
            overlap_period: Duration::from_secs(3600),
        };
        let blobs = svc.descriptor_publish(10, Duration::from_secs(3600), 2, &near_rotation, true).unwrap();
        assert_eq!(blobs.len(), 4, "2 * REPLICAS posts when straddling a rotation boundary");
    }

    #[test]
    fn active_standby_sticks_with_preferred_instance() {
        let mut svc = Service::new(
            test_service_key(),
            vec![ready_instance("a"), ready_instance("b")],
            HealthCheck::None,
            SelectionMode::ActiveStandby,
        );
        let first = svc.select_instances(Duration::from_secs(3600));
        assert_eq!(first, vec![0]);

        let second = svc.select_instances(Duration::from_secs(3600));
        assert_eq!(second, vec![0], "should stick with the same preferred instance");
    }

    #[test]
    fn active_standby_fails_over_when_preferred_becomes_unhealthy() {
        let mut svc = Service::new(
            test_service_key(),
            vec![ready_instance("a"), ready_instance("b")],
            HealthCheck::None,
            SelectionMode::ActiveStandby,
        );
        svc.select_instances(Duration::from_secs(3600));
        svc.instances[0].health = crate::core::health::Health::Down;

        let selected = svc.select_instances(Duration::from_secs(3600));
        assert_eq!(selected, vec![1]);
    }

    #[test]
    fn unhealthy_instance_is_excluded_from_round_robin_selection() {
        let mut a = ready_instance("a");
        a.health = crate::core::health::Health::Down;
        let mut svc = Service::new(test_service_key(), vec![a, ready_instance("b")], HealthCheck::None, SelectionMode::RoundRobin);
        let selected = svc.select_instances(Duration::from_secs(3600));
        assert_eq!(selected, vec![1]);
    }

    #[test]
    fn instance_never_received_a_descriptor_is_excluded() {
        let fresh = Instance::new("never-seen");
        let mut svc = Service::new(test_service_key(), vec![fresh, ready_instance("b")], HealthCheck::None, SelectionMode::RoundRobin);
        let selected = svc.select_instances(Duration::from_secs(3600));
        assert_eq!(selected, vec![1]);
    }

    #[test]
    fn instance_stale_past_upload_period_is_excluded_even_within_max_descriptor_age() {
        // `received` and `timestamp` are both 2h old: within the 4h
        // `MAX_DESCRIPTOR_AGE` bound but past the 1h `upload_period` bound,
        // so this instance must be excluded even though its descriptor
        // identity is well within `max_descriptor_age`.
        let mut stale = ready_instance("a");
        let two_hours_ago = Utc::now() - chrono::Duration::hours(2);
        stale.received = Some(two_hours_ago);
        stale.timestamp = Some(two_hours_ago);

        let mut svc = Service::new(test_service_key(), vec![stale, ready_instance("b")], HealthCheck::None, SelectionMode::RoundRobin);
        let selected = svc.select_instances(Duration::from_secs(3600));
        assert_eq!(selected, vec![1]);
    }
}

// src/daemon.rs

//! The manager's single-threaded core: one value owning every Service,
//! the control-channel client, the scheduler, and the status socket.
//! Replaces module-level mutable state with an explicit owner, per the
//! re-architecture this implementation follows: everything the scheduler,
//! the event handler, and the status server touch hangs off one `Daemon`,
//! reachable only from its own `run` loop.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::control::{ControlClient, DescriptorEvent};
use crate::core::errors::OnionBalanceError;
use crate::core::health::{self, ProbeOutcome};
use crate::core::scheduler::Scheduler;
use crate::core::service::{RotationParams, Service};
use crate::core::status::StatusServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobKind {
    RefreshInstances,
    HealthCheck,
    PublishCheck,
}

struct ProbeResult {
    service_idx: usize,
    instance_idx: usize,
    outcome: ProbeOutcome,
}

pub struct Daemon {
    services: Vec<Service>,
    control: ControlClient,
    status: StatusServer,
    scheduler: Scheduler<JobKind>,
    socks_addr: SocketAddr,
    max_intro_points: usize,
    replicas: usize,
    upload_period: Duration,
    initial_stagger: Duration,
    rotation: RotationParams,
    probe_tx: mpsc::Sender<ProbeResult>,
    probe_rx: mpsc::Receiver<ProbeResult>,
}

impl Daemon {
    pub async fn new(config: Config, services: Vec<Service>) -> Result<Self, OnionBalanceError> {
        let mut control = ControlClient::connect(config.control_address()).await?;
        control.authenticate(config.tor_control_password.as_deref()).await?;

        let version = control.get_version().await?;
        if !version_supports_post_descriptor(&version) {
            return Err(OnionBalanceError::ControlVersionTooOld {
                required: "0.2.7.1".to_string(),
                actual: version,
            });
        }

        control.subscribe_descriptor_events().await?;

        let status = StatusServer::bind(&config.status_socket_location)
            .map_err(|e| OnionBalanceError::StatusSocketError(e.to_string()))?;

        let mut scheduler = Scheduler::new();
        scheduler.add(JobKind::RefreshInstances, config.refresh_interval);
        scheduler.add(JobKind::HealthCheck, config.publish_check_interval);
        scheduler.add(JobKind::PublishCheck, config.publish_check_interval);

        let (probe_tx, probe_rx) = mpsc::channel(256);

        Ok(Self {
            services,
            control,
            status,
            scheduler,
            socks_addr: config.tor_socks_address(),
            max_intro_points: config.max_intro_points,
            replicas: config.replicas,
            upload_period: config.descriptor_upload_period,
            initial_stagger: config.initial_stagger,
            rotation: RotationParams {
                validity_period: config.descriptor_validity_period,
                overlap_period: config.descriptor_overlap_period,
            },
            probe_tx,
            probe_rx,
        })
    }

    /// Runs the staggered initial pass (`run_all`-equivalent), then the
    /// cooperative main loop, until a fatal error occurs or the process
    /// receives SIGINT/SIGTERM.
    pub async fn run(mut self) -> Result<(), OnionBalanceError> {
        for kind in self.scheduler.run_all() {
            self.dispatch(kind).await;
            tokio::time::sleep(self.initial_stagger).await;
        }

        loop {
            self.drain_probe_results();

            tokio::select! {
                biased;

                _ = shutdown_signal() => {
                    info!("received shutdown signal, closing control channel and status socket");
                    return Ok(());
                }

                event = self.control.next_event() => {
                    match event {
                        Ok(Some(reply)) => self.handle_event(reply),
                        Ok(None) => {
                            return Err(OnionBalanceError::ControlChannelLost(
                                "control connection closed".into(),
                            ));
                        }
                        Err(e) => return Err(e),
                    }
                }

                accepted = self.status.try_accept(Duration::from_secs(1)) => {
                    match accepted {
                        Ok(Some(mut stream)) => {
                            if let Err(e) = StatusServer::serve_snapshot(&mut stream, &self.services).await {
                                warn!("status socket write failed: {}", e);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("status socket accept failed: {}", e),
                    }
                }

                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }

            for kind in self.scheduler.due() {
                self.dispatch(kind).await;
            }
        }
    }

    fn drain_probe_results(&mut self) {
        while let Ok(result) = self.probe_rx.try_recv() {
            if let Some(service) = self.services.get_mut(result.service_idx)
                && let Some(instance) = service.instances.get_mut(result.instance_idx)
            {
                let check = service.health_check.clone();
                instance.record_probe(&check, result.outcome);
            }
        }
    }

    fn handle_event(&mut self, reply: crate::core::control::Reply) {
        let Some(event) = crate::core::control::event::parse(&reply) else {
            return;
        };
        match &event {
            DescriptorEvent::StateChange { onion_address, action } => {
                info!(%onion_address, %action, "descriptor event");
            }
            DescriptorEvent::Content { onion_address, .. } => {
                info!(%onion_address, "descriptor content received");
            }
        }

        let mut refs: Vec<&mut crate::core::instance::Instance> =
            self.services.iter_mut().flat_map(|s| s.instances.iter_mut()).collect();
        if let Err(e) = crate::core::control::event::apply(event, &mut refs) {
            warn!("failed to apply descriptor event: {}", e);
        }
    }

    async fn dispatch(&mut self, kind: JobKind) {
        match kind {
            JobKind::RefreshInstances => self.refresh_instances().await,
            JobKind::HealthCheck => self.spawn_health_checks(),
            JobKind::PublishCheck => self.publish_all().await,
        }
    }

    async fn refresh_instances(&mut self) {
        if let Err(e) = self.control.signal_new_identity().await {
            warn!("SIGNAL NEWNYM failed: {}", e);
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        for service in &self.services {
            for instance in &service.instances {
                if let Err(e) = self.control.fetch_descriptor(&instance.onion_address).await {
                    warn!(onion_address = %instance.onion_address, "descriptor fetch request failed: {}", e);
                }
            }
        }
    }

    fn spawn_health_checks(&mut self) {
        for (service_idx, service) in self.services.iter().enumerate() {
            if service.health_check.is_none() {
                continue;
            }
            for (instance_idx, instance) in service.instances.iter().enumerate() {
                let check = service.health_check.clone();
                let onion_address = instance.onion_address.clone();
                let socks_addr = self.socks_addr;
                let tx = self.probe_tx.clone();
                tokio::spawn(async move {
                    let outcome = health::probe(&check, &onion_address, socks_addr).await;
                    let _ = tx.send(ProbeResult { service_idx, instance_idx, outcome }).await;
                });
            }
        }
    }

    async fn publish_all(&mut self) {
        for service in &mut self.services {
            match service.descriptor_publish(self.max_intro_points, self.upload_period, self.replicas, &self.rotation, false) {
                Ok(blobs) if blobs.is_empty() => {}
                Ok(blobs) => {
                    for blob in blobs {
                        if let Err(e) = self.control.post_descriptor(&blob).await {
                            error!(onion_address = %service.onion_address(), "descriptor post failed: {}", e);
                        }
                    }
                    service.mark_uploaded();
                }
                Err(e) => error!(onion_address = %service.onion_address(), "descriptor generation failed: {}", e),
            }
        }
    }
}

/// Resolves once the process receives SIGINT or SIGTERM, per spec.md §5
/// ("Cancellation: process-level only. SIGINT/SIGTERM close the
/// control-channel session and the status socket, flush logs, and exit with
/// code 0."). `Daemon::run` returning `Ok(())` on either signal is what
/// drives that exit-0 behavior: dropping `self` on the way out closes the
/// control socket and removes the status socket via `StatusServer`'s `Drop`.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

fn version_supports_post_descriptor(version: &str) -> bool {
    let mut parts = version.split(|c: char| !c.is_ascii_digit()).filter(|s| !s.is_empty());
    let major: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let micro: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let patch: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (major, minor, micro, patch) >= (0, 2, 7, 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_check_accepts_newer_and_rejects_older() {
        assert!(version_supports_post_descriptor("0.2.7.1"));
        assert!(version_supports_post_descriptor("0.4.8.10"));
        assert!(!version_supports_post_descriptor("0.2.6.10"));
        assert!(!version_supports_post_descriptor("0.2.7.0"));
    }
}

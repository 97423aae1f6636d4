//! Per-gateway stream pipeline.
//!
//! One pipeline runs per connected gateway: an uplink pump and a status
//! pump per southbound backend, and a downlink pump per northbound
//! backend. Each pump is a supervisor that re-subscribes with backoff
//! after its stream errors or ends, and exits only on cancellation.
//! Per-message publish failures are logged and the message dropped; the
//! pipeline is the unit of failure isolation.

use backend::{Northbound, Southbound};
use common::{Backoff, GatewayId};
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Upper bound on a single publish; a wedged backend drops the
    /// message instead of blocking the pump.
    pub publish_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

/// Running relay tasks for one gateway. Owned by the exchange; dropped
/// only through [`Pipeline::stop`].
pub struct Pipeline {
    gateway_id: GatewayId,
    cancel: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn start(
        gateway_id: GatewayId,
        southbounds: Vec<Arc<dyn Southbound>>,
        northbounds: Vec<Arc<dyn Northbound>>,
        config: PipelineConfig,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        let mut tasks = Vec::new();

        for south in &southbounds {
            tasks.push(tokio::spawn(run_uplink(
                gateway_id.clone(),
                south.clone(),
                northbounds.clone(),
                config.clone(),
                cancel.subscribe(),
            )));
            tasks.push(tokio::spawn(run_status(
                gateway_id.clone(),
                south.clone(),
                northbounds.clone(),
                config.clone(),
                cancel.subscribe(),
            )));
        }
        for north in &northbounds {
            tasks.push(tokio::spawn(run_downlink(
                gateway_id.clone(),
                north.clone(),
                southbounds.clone(),
                config.clone(),
                cancel.subscribe(),
            )));
        }

        debug!(gateway_id = %gateway_id, tasks = tasks.len(), "pipeline started");
        Self {
            gateway_id,
            cancel,
            tasks,
        }
    }

    /// Signals every pump to stop and waits for all of them.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        debug!(gateway_id = %self.gateway_id, "pipeline stopped");
    }
}

async fn run_uplink(
    gateway_id: GatewayId,
    south: Arc<dyn Southbound>,
    northbounds: Vec<Arc<dyn Northbound>>,
    config: PipelineConfig,
    mut cancel: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(config.reconnect_delay, config.max_reconnect_delay);
    'supervise: loop {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.changed() => break 'supervise,
            result = south.subscribe_uplink(&gateway_id) => match result {
                Ok(stream) => {
                    backoff.reset();
                    stream
                }
                Err(err) => {
                    warn!(gateway_id = %gateway_id, error = %err, "uplink subscribe failed");
                    if wait_or_cancel(&mut cancel, backoff.next()).await {
                        break 'supervise;
                    }
                    continue 'supervise;
                }
            },
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => break 'supervise,
                msg = stream.recv() => match msg {
                    Some(msg) => {
                        for north in &northbounds {
                            publish_with_timeout(
                                "uplink",
                                config.publish_timeout,
                                north.publish_uplink(msg.clone()),
                                &gateway_id,
                            )
                            .await;
                        }
                    }
                    None => {
                        debug!(gateway_id = %gateway_id, "uplink stream ended");
                        break;
                    }
                },
            }
        }

        if wait_or_cancel(&mut cancel, backoff.next()).await {
            break 'supervise;
        }
    }
}

async fn run_status(
    gateway_id: GatewayId,
    south: Arc<dyn Southbound>,
    northbounds: Vec<Arc<dyn Northbound>>,
    config: PipelineConfig,
    mut cancel: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(config.reconnect_delay, config.max_reconnect_delay);
    'supervise: loop {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.changed() => break 'supervise,
            result = south.subscribe_status(&gateway_id) => match result {
                Ok(stream) => {
                    backoff.reset();
                    stream
                }
                Err(err) => {
                    warn!(gateway_id = %gateway_id, error = %err, "status subscribe failed");
                    if wait_or_cancel(&mut cancel, backoff.next()).await {
                        break 'supervise;
                    }
                    continue 'supervise;
                }
            },
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => break 'supervise,
                msg = stream.recv() => match msg {
                    Some(msg) => {
                        for north in &northbounds {
                            publish_with_timeout(
                                "status",
                                config.publish_timeout,
                                north.publish_status(msg.clone()),
                                &gateway_id,
                            )
                            .await;
                        }
                    }
                    None => {
                        debug!(gateway_id = %gateway_id, "status stream ended");
                        break;
                    }
                },
            }
        }

        if wait_or_cancel(&mut cancel, backoff.next()).await {
            break 'supervise;
        }
    }
}

async fn run_downlink(
    gateway_id: GatewayId,
    north: Arc<dyn Northbound>,
    southbounds: Vec<Arc<dyn Southbound>>,
    config: PipelineConfig,
    mut cancel: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(config.reconnect_delay, config.max_reconnect_delay);
    'supervise: loop {
        let mut stream = tokio::select! {
            biased;
            _ = cancel.changed() => break 'supervise,
            result = north.subscribe_downlink(&gateway_id) => match result {
                Ok(stream) => {
                    backoff.reset();
                    stream
                }
                Err(err) => {
                    warn!(gateway_id = %gateway_id, error = %err, "downlink subscribe failed");
                    if wait_or_cancel(&mut cancel, backoff.next()).await {
                        break 'supervise;
                    }
                    continue 'supervise;
                }
            },
        };

        loop {
            tokio::select! {
                biased;
                _ = cancel.changed() => {
                    let _ = north.unsubscribe_downlink(&gateway_id).await;
                    break 'supervise;
                }
                msg = stream.recv() => match msg {
                    Some(msg) => {
                        for south in &southbounds {
                            publish_with_timeout(
                                "downlink",
                                config.publish_timeout,
                                south.publish_downlink(msg.clone()),
                                &gateway_id,
                            )
                            .await;
                        }
                    }
                    None => {
                        debug!(gateway_id = %gateway_id, "downlink stream ended");
                        break;
                    }
                },
            }
        }

        if wait_or_cancel(&mut cancel, backoff.next()).await {
            break 'supervise;
        }
    }
}

async fn publish_with_timeout(
    path: &'static str,
    limit: Duration,
    publish: impl std::future::Future<Output = backend::Result<()>>,
    gateway_id: &GatewayId,
) {
    match timeout(limit, publish).await {
        Ok(Ok(())) => {
            counter!("bridge_messages_forwarded_total", "path" => path).increment(1);
        }
        Ok(Err(err)) => {
            warn!(gateway_id = %gateway_id, path, error = %err, "publish failed, dropping message");
            counter!("bridge_messages_dropped_total", "path" => path).increment(1);
        }
        Err(_) => {
            warn!(gateway_id = %gateway_id, path, "publish timed out, dropping message");
            counter!("bridge_messages_dropped_total", "path" => path).increment(1);
        }
    }
}

/// Sleeps for `delay`, returning early with `true` when cancelled.
async fn wait_or_cancel(cancel: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

//! Router adapter: implements the northbound backend contract on top of
//! the upstream router service.
//!
//! Uplink and status publishes route through the per-gateway
//! [`ConnectionCache`]; downlink subscriptions run a supervised reconnect
//! loop that re-subscribes with backoff after transient stream errors and
//! closes the delivered channel on graceful end of stream.

use crate::cache::ConnectionCache;
use crate::error::{Error, Result};
use crate::link::{GatewayLink, GatewayTokenFn, RouterConfig, RouterConn, RouterDialer, TokenFn};
use async_trait::async_trait;
use backend::traits::{MessageStream, Northbound};
use common::{Backoff, DownlinkMessage, GatewayId, StatusMessage, UplinkMessage};
use dashmap::DashMap;
use metrics::counter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

const DOWNLINK_CAPACITY: usize = 16;

type LinkOf<D> = <<D as RouterDialer>::Conn as RouterConn>::Link;

struct Inner<D: RouterDialer> {
    config: RouterConfig,
    dialer: D,
    token_fn: TokenFn,
    conn: RwLock<Option<Arc<D::Conn>>>,
    cache: ConnectionCache<LinkOf<D>>,
    downlink_stops: DashMap<GatewayId, watch::Sender<bool>>,
}

pub struct RouterBackend<D: RouterDialer> {
    inner: Arc<Inner<D>>,
}

impl<D: RouterDialer> RouterBackend<D> {
    pub fn new(dialer: D, config: RouterConfig, token_fn: TokenFn) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                dialer,
                token_fn,
                conn: RwLock::new(None),
                cache: ConnectionCache::new(),
                downlink_stops: DashMap::new(),
            }),
        }
    }
}

impl<D: RouterDialer> Inner<D> {
    /// Cached link for a gateway, created on first use. The token closure
    /// is invoked by the link at stream establishment, so rotated keys take
    /// effect without a release/get cycle.
    async fn link_for(&self, id: &GatewayId) -> Result<Arc<LinkOf<D>>> {
        let conn = self
            .conn
            .read()
            .await
            .clone()
            .ok_or(Error::NotConnected)?;
        let token_fn = self.token_fn.clone();
        let gateway_id = id.clone();
        let token: GatewayTokenFn = Arc::new(move || token_fn(&gateway_id));
        Ok(self.cache.get(id, || conn.gateway_link(id, token)).await)
    }

    fn stop_downlink(&self, id: &GatewayId) {
        if let Some((_, stop)) = self.downlink_stops.remove(id) {
            let _ = stop.send(true);
        }
    }

    /// Downlink supervisor for one gateway: subscribe, stream, back off,
    /// repeat. A stream error re-subscribes from the top; a stream that
    /// ends without an error closes `out` and terminates the loop.
    async fn run_downlink(
        self: Arc<Self>,
        id: GatewayId,
        out: mpsc::Sender<DownlinkMessage>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut backoff = Backoff::new(self.config.reconnect_delay, self.config.max_reconnect_delay);
        'supervise: loop {
            let link = match self.link_for(&id).await {
                Ok(link) => link,
                Err(err) => {
                    warn!(gateway_id = %id, error = %err, "cannot reach router for downlink");
                    if wait_or_stop(&mut stop, backoff.next()).await {
                        break 'supervise;
                    }
                    continue 'supervise;
                }
            };
            let mut stream = match link.subscribe().await {
                Ok(stream) => {
                    backoff.reset();
                    stream
                }
                Err(err) => {
                    warn!(gateway_id = %id, error = %err, "downlink subscribe failed");
                    if wait_or_stop(&mut stop, backoff.next()).await {
                        break 'supervise;
                    }
                    continue 'supervise;
                }
            };
            debug!(gateway_id = %id, "downlink stream open");

            loop {
                tokio::select! {
                    biased;

                    _ = stop.changed() => {
                        let _ = link.unsubscribe().await;
                        break 'supervise;
                    }

                    frame = stream.recv() => match frame {
                        Some(Ok(payload)) => {
                            counter!("bridge_router_downlink_total").increment(1);
                            let msg = DownlinkMessage {
                                gateway_id: id.clone(),
                                payload,
                            };
                            if out.send(msg).await.is_err() {
                                let _ = link.unsubscribe().await;
                                break 'supervise;
                            }
                        }
                        Some(Err(err)) => {
                            warn!(gateway_id = %id, error = %err, "error on downlink stream");
                            break;
                        }
                        None => {
                            info!(gateway_id = %id, "downlink stream closed by router");
                            break 'supervise;
                        }
                    }
                }
            }

            if wait_or_stop(&mut stop, backoff.next()).await {
                break 'supervise;
            }
        }
        debug!(gateway_id = %id, "downlink supervisor terminated");
    }
}

/// Sleeps for `delay`, returning early with `true` if the stop signal fires.
async fn wait_or_stop(stop: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = stop.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[async_trait]
impl<D: RouterDialer> Northbound for RouterBackend<D> {
    async fn connect(&self) -> backend::Result<()> {
        let conn = self
            .inner
            .dialer
            .dial(&self.inner.config)
            .await
            .map_err(backend::Error::from)?;
        let mut slot = self.inner.conn.write().await;
        if let Some(old) = slot.take() {
            old.close().await;
        }
        *slot = Some(Arc::new(conn));
        info!(router_id = %self.inner.config.router_id, "connected to router");
        Ok(())
    }

    async fn disconnect(&self) -> backend::Result<()> {
        let ids: Vec<GatewayId> = self
            .inner
            .downlink_stops
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.inner.stop_downlink(&id);
        }
        self.inner.cache.release_all().await;
        if let Some(conn) = self.inner.conn.write().await.take() {
            conn.close().await;
        }
        info!(router_id = %self.inner.config.router_id, "disconnected from router");
        Ok(())
    }

    async fn publish_uplink(&self, msg: UplinkMessage) -> backend::Result<()> {
        let link = self
            .inner
            .link_for(&msg.gateway_id)
            .await
            .map_err(backend::Error::from)?;
        link.send_uplink(msg.payload)
            .await
            .map_err(backend::Error::from)?;
        counter!("bridge_router_uplink_total").increment(1);
        Ok(())
    }

    async fn publish_status(&self, msg: StatusMessage) -> backend::Result<()> {
        let link = self
            .inner
            .link_for(&msg.gateway_id)
            .await
            .map_err(backend::Error::from)?;
        link.send_status(msg.payload)
            .await
            .map_err(backend::Error::from)?;
        counter!("bridge_router_status_total").increment(1);
        Ok(())
    }

    async fn subscribe_downlink(
        &self,
        id: &GatewayId,
    ) -> backend::Result<MessageStream<DownlinkMessage>> {
        let (out_tx, out_rx) = mpsc::channel(DOWNLINK_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        if let Some(previous) = self.inner.downlink_stops.insert(id.clone(), stop_tx) {
            let _ = previous.send(true);
        }
        let inner = self.inner.clone();
        let gateway_id = id.clone();
        tokio::spawn(inner.run_downlink(gateway_id, out_tx, stop_rx));
        Ok(out_rx)
    }

    async fn unsubscribe_downlink(&self, id: &GatewayId) -> backend::Result<()> {
        self.inner.stop_downlink(id);
        Ok(())
    }

    async fn cleanup_gateway(&self, id: &GatewayId) {
        self.inner.stop_downlink(id);
        self.inner.cache.release(id).await;
    }

    async fn prune_idle(&self, max_idle: Duration, active: &HashSet<GatewayId>) {
        let evicted = self.inner.cache.prune_idle(max_idle, active).await;
        for id in &evicted {
            self.inner.stop_downlink(id);
            info!(gateway_id = %id, "evicted idle router link");
        }
    }
}

//! Exchange orchestration: event dispatch, worker pool, gateway lifecycle.

use crate::error::{Error, Result};
use crate::keyed::KeyedLocks;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::registry::Registry;
use auth::AuthStore;
use backend::{Northbound, Southbound};
use common::{ConnectMessage, DisconnectMessage, GatewayId};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Depth of the internal event queue between dispatchers and workers.
    pub queue_depth: usize,
    pub publish_timeout: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Router links idle longer than this whose gateway left the registry
    /// are evicted by the housekeeping sweep.
    pub idle_link_timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            queue_depth: 32,
            publish_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            idle_link_timeout: Duration::from_secs(600),
        }
    }
}

enum Event {
    Connect(ConnectMessage),
    Disconnect(DisconnectMessage),
}

struct Running {
    cancel: watch::Sender<bool>,
    dispatchers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    housekeeper: JoinHandle<()>,
}

/// Routes gateway lifecycle events and runs one [`Pipeline`] per
/// connected gateway.
///
/// Backends are registered before [`Exchange::start`]; events for the
/// same gateway serialize through a keyed lock, events for different
/// gateways run in parallel up to the worker-pool size.
pub struct Exchange {
    southbounds: Vec<Arc<dyn Southbound>>,
    northbounds: Vec<Arc<dyn Northbound>>,
    auth: Arc<dyn AuthStore>,
    registry: Registry,
    pipelines: Mutex<HashMap<GatewayId, Pipeline>>,
    locks: KeyedLocks,
    config: ExchangeConfig,
    running: Mutex<Option<Running>>,
}

impl Exchange {
    pub fn new(auth: Arc<dyn AuthStore>) -> Self {
        Self::with_config(auth, ExchangeConfig::default())
    }

    pub fn with_config(auth: Arc<dyn AuthStore>, config: ExchangeConfig) -> Self {
        Self {
            southbounds: Vec::new(),
            northbounds: Vec::new(),
            auth,
            registry: Registry::new(),
            pipelines: Mutex::new(HashMap::new()),
            locks: KeyedLocks::new(),
            config,
            running: Mutex::new(None),
        }
    }

    pub fn add_southbound(&mut self, backend: Arc<dyn Southbound>) {
        self.southbounds.push(backend);
    }

    pub fn add_northbound(&mut self, backend: Arc<dyn Northbound>) {
        self.northbounds.push(backend);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            publish_timeout: self.config.publish_timeout,
            reconnect_delay: self.config.reconnect_delay,
            max_reconnect_delay: self.config.max_reconnect_delay,
        }
    }

    /// Connects every backend, opens the lifecycle-event subscriptions and
    /// launches the worker pool plus the housekeeping tick. Returns as
    /// soon as everything runs; backend connect failures are fatal.
    pub async fn start(
        self: &Arc<Self>,
        workers: usize,
        poll_interval: Duration,
    ) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::AlreadyRunning);
        }

        for south in &self.southbounds {
            south.connect().await?;
        }
        for north in &self.northbounds {
            north.connect().await?;
        }

        let (event_tx, event_rx) = mpsc::channel::<Event>(self.config.queue_depth);
        let event_rx = Arc::new(Mutex::new(event_rx));
        let (cancel, _) = watch::channel(false);

        let mut dispatchers = Vec::new();
        for south in &self.southbounds {
            let connects = south.subscribe_connect().await?;
            dispatchers.push(tokio::spawn(dispatch(
                connects,
                event_tx.clone(),
                cancel.subscribe(),
                Event::Connect as fn(ConnectMessage) -> Event,
            )));
            let disconnects = south.subscribe_disconnect().await?;
            dispatchers.push(tokio::spawn(dispatch(
                disconnects,
                event_tx.clone(),
                cancel.subscribe(),
                Event::Disconnect as fn(DisconnectMessage) -> Event,
            )));
        }

        let mut worker_handles = Vec::new();
        for index in 0..workers.max(1) {
            let exchange = self.clone();
            let queue = event_rx.clone();
            worker_handles.push(tokio::spawn(async move {
                loop {
                    let event = { queue.lock().await.recv().await };
                    match event {
                        Some(event) => exchange.handle_event(event).await,
                        None => break,
                    }
                }
                debug!(worker = index, "worker drained");
            }));
        }

        let housekeeper = {
            let exchange = self.clone();
            let mut cancel_rx = cancel.subscribe();
            let period = poll_interval.max(Duration::from_millis(1));
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel_rx.changed() => break,
                        _ = tick.tick() => {
                            let active = exchange.registry.snapshot();
                            for north in &exchange.northbounds {
                                north
                                    .prune_idle(exchange.config.idle_link_timeout, &active)
                                    .await;
                            }
                        }
                    }
                }
            })
        };

        *running = Some(Running {
            cancel,
            dispatchers,
            workers: worker_handles,
            housekeeper,
        });
        info!(
            workers = workers.max(1),
            southbounds = self.southbounds.len(),
            northbounds = self.northbounds.len(),
            "exchange started"
        );
        Ok(())
    }

    /// Stops dispatch, drains queued events, tears down every pipeline and
    /// releases all per-gateway resources. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            debug!("exchange already stopped");
            return;
        };
        info!("stopping exchange");

        let _ = running.cancel.send(true);
        for dispatcher in running.dispatchers {
            let _ = dispatcher.await;
        }
        // queue senders are gone now; workers exit after draining
        for worker in running.workers {
            let _ = worker.await;
        }
        let _ = running.housekeeper.await;

        let pipelines: Vec<(GatewayId, Pipeline)> =
            self.pipelines.lock().await.drain().collect();
        for (id, pipeline) in pipelines {
            pipeline.stop().await;
            for north in &self.northbounds {
                north.cleanup_gateway(&id).await;
            }
            for south in &self.southbounds {
                south.cleanup_gateway(&id).await;
            }
            self.auth.delete(&id);
        }
        self.registry.clear();
        gauge!("bridge_connected_gateways").set(0.0);
        info!("exchange stopped");
    }

    async fn handle_event(&self, event: Event) {
        match event {
            Event::Connect(msg) => self.handle_connect(msg).await,
            Event::Disconnect(msg) => self.handle_disconnect(msg).await,
        }
    }

    async fn handle_connect(&self, msg: ConnectMessage) {
        if msg.gateway_id.is_empty() {
            warn!("dropping connect event with empty gateway id");
            return;
        }
        let _slot = self.locks.lock(&msg.gateway_id).await;

        if self.registry.contains(&msg.gateway_id) {
            debug!(gateway_id = %msg.gateway_id, "gateway already connected");
            counter!("bridge_events_total", "event" => "connect", "result" => "duplicate")
                .increment(1);
            return;
        }

        self.auth.set_key(&msg.gateway_id, &msg.key);
        let pipeline = Pipeline::start(
            msg.gateway_id.clone(),
            self.southbounds.clone(),
            self.northbounds.clone(),
            self.pipeline_config(),
        );
        self.pipelines
            .lock()
            .await
            .insert(msg.gateway_id.clone(), pipeline);
        self.registry.add(&msg.gateway_id);

        counter!("bridge_events_total", "event" => "connect", "result" => "ok").increment(1);
        gauge!("bridge_connected_gateways").set(self.registry.len() as f64);
        info!(gateway_id = %msg.gateway_id, "gateway connected");
    }

    async fn handle_disconnect(&self, msg: DisconnectMessage) {
        if msg.gateway_id.is_empty() {
            warn!("dropping disconnect event with empty gateway id");
            return;
        }
        let _slot = self.locks.lock(&msg.gateway_id).await;

        if !self.registry.contains(&msg.gateway_id) {
            debug!(gateway_id = %msg.gateway_id, "gateway not connected");
            counter!("bridge_events_total", "event" => "disconnect", "result" => "duplicate")
                .increment(1);
            return;
        }
        if !self.auth.validate_key(&msg.gateway_id, &msg.key) {
            warn!(gateway_id = %msg.gateway_id, "unauthorized disconnect ignored");
            counter!("bridge_events_total", "event" => "disconnect", "result" => "unauthorized")
                .increment(1);
            return;
        }

        let pipeline = self.pipelines.lock().await.remove(&msg.gateway_id);
        if let Some(pipeline) = pipeline {
            pipeline.stop().await;
        }
        for north in &self.northbounds {
            north.cleanup_gateway(&msg.gateway_id).await;
        }
        for south in &self.southbounds {
            south.cleanup_gateway(&msg.gateway_id).await;
        }
        self.auth.delete(&msg.gateway_id);
        self.registry.remove(&msg.gateway_id);

        counter!("bridge_events_total", "event" => "disconnect", "result" => "ok").increment(1);
        gauge!("bridge_connected_gateways").set(self.registry.len() as f64);
        info!(gateway_id = %msg.gateway_id, "gateway disconnected");
    }
}

async fn dispatch<T: Send + 'static>(
    mut stream: mpsc::Receiver<T>,
    queue: mpsc::Sender<Event>,
    mut cancel: watch::Receiver<bool>,
    wrap: fn(T) -> Event,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.changed() => break,
            msg = stream.recv() => match msg {
                Some(msg) => {
                    if queue.send(wrap(msg)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use auth::MemoryAuthStore;
    use backend::{DummyBackend, MessageStream};
    use bytes::Bytes;
    use common::{DownlinkMessage, StatusMessage, UplinkMessage};
    use tokio::time::{sleep, timeout};

    fn fast_config() -> ExchangeConfig {
        ExchangeConfig {
            publish_timeout: Duration::from_millis(500),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(50),
            ..ExchangeConfig::default()
        }
    }

    async fn started() -> (Arc<Exchange>, Arc<DummyBackend>, Arc<DummyBackend>) {
        let ttn = Arc::new(DummyBackend::new("ttn"));
        let gateway = Arc::new(DummyBackend::new("gateway"));
        let mut exchange = Exchange::with_config(Arc::new(MemoryAuthStore::new()), fast_config());
        exchange.add_southbound(gateway.clone());
        exchange.add_northbound(ttn.clone());
        let exchange = Arc::new(exchange);
        exchange.start(1, Duration::from_millis(10)).await.unwrap();
        (exchange, gateway, ttn)
    }

    fn connect_msg(id: &str, key: &str) -> ConnectMessage {
        ConnectMessage {
            gateway_id: id.to_string(),
            key: key.to_string(),
        }
    }

    fn disconnect_msg(id: &str, key: &str) -> DisconnectMessage {
        DisconnectMessage {
            gateway_id: id.to_string(),
            key: key.to_string(),
        }
    }

    async fn eventually(what: &str, condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while tokio::time::Instant::now() < deadline {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn connect_and_settle(
        exchange: &Arc<Exchange>,
        gateway: &Arc<DummyBackend>,
        id: &str,
        key: &str,
    ) {
        gateway.publish_connect(connect_msg(id, key)).await.unwrap();
        eventually("gateway to connect", || exchange.registry().contains(id)).await;
        // give the pipeline pumps a moment to open their subscriptions
        sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn connect_then_disconnect_with_matching_key() {
        let (exchange, gateway, _ttn) = started().await;

        gateway
            .publish_connect(connect_msg("dev", "key"))
            .await
            .unwrap();
        eventually("connect", || exchange.registry().contains("dev")).await;

        gateway
            .publish_disconnect(disconnect_msg("dev", "key"))
            .await
            .unwrap();
        eventually("disconnect", || !exchange.registry().contains("dev")).await;

        exchange.stop().await;
    }

    #[tokio::test]
    async fn disconnect_with_wrong_key_is_ignored() {
        let (exchange, gateway, _ttn) = started().await;

        gateway
            .publish_connect(connect_msg("dev", "key"))
            .await
            .unwrap();
        eventually("connect", || exchange.registry().contains("dev")).await;

        gateway
            .publish_disconnect(disconnect_msg("dev", "other-key"))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(exchange.registry().contains("dev"));

        exchange.stop().await;
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let (exchange, gateway, _ttn) = started().await;

        for _ in 0..2 {
            gateway
                .publish_connect(connect_msg("dev", ""))
                .await
                .unwrap();
            eventually("connect", || exchange.registry().contains("dev")).await;
        }
        assert_eq!(exchange.registry().len(), 1);

        exchange.stop().await;
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (exchange, gateway, _ttn) = started().await;

        gateway
            .publish_connect(connect_msg("dev", ""))
            .await
            .unwrap();
        eventually("connect", || exchange.registry().contains("dev")).await;

        for _ in 0..2 {
            gateway
                .publish_disconnect(disconnect_msg("dev", ""))
                .await
                .unwrap();
            sleep(Duration::from_millis(100)).await;
            assert!(!exchange.registry().contains("dev"));
        }

        exchange.stop().await;
    }

    #[tokio::test]
    async fn uplink_round_trip() {
        let (exchange, gateway, ttn) = started().await;
        connect_and_settle(&exchange, &gateway, "dev", "").await;

        let mut rx = ttn.subscribe_uplink(&"dev".to_string()).await.unwrap();
        gateway
            .publish_uplink(UplinkMessage {
                gateway_id: "dev".to_string(),
                payload: Bytes::from_static(b"frame"),
            })
            .await
            .unwrap();

        let msg = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("uplink should reach the router side")
            .unwrap();
        assert_eq!(msg.gateway_id, "dev");
        assert_eq!(msg.payload, Bytes::from_static(b"frame"));

        exchange.stop().await;
    }

    #[tokio::test]
    async fn status_round_trip() {
        let (exchange, gateway, ttn) = started().await;
        connect_and_settle(&exchange, &gateway, "dev", "").await;

        let mut rx = ttn.subscribe_status(&"dev".to_string()).await.unwrap();
        gateway
            .publish_status(StatusMessage {
                gateway_id: "dev".to_string(),
                payload: Bytes::from_static(b"healthy"),
            })
            .await
            .unwrap();

        let msg = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("status should reach the router side")
            .unwrap();
        assert_eq!(msg.gateway_id, "dev");

        exchange.stop().await;
    }

    #[tokio::test]
    async fn downlink_round_trip() {
        let (exchange, gateway, ttn) = started().await;
        connect_and_settle(&exchange, &gateway, "dev", "").await;

        let mut rx = gateway
            .subscribe_downlink(&"dev".to_string())
            .await
            .unwrap();
        ttn.publish_downlink(DownlinkMessage {
            gateway_id: "dev".to_string(),
            payload: Bytes::from_static(b"schedule"),
        })
        .await
        .unwrap();

        let msg = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("downlink should reach the gateway side")
            .unwrap();
        assert_eq!(msg.gateway_id, "dev");
        assert_eq!(msg.payload, Bytes::from_static(b"schedule"));

        exchange.stop().await;
    }

    #[tokio::test]
    async fn stop_tears_everything_down_and_is_idempotent() {
        let (exchange, gateway, _ttn) = started().await;

        gateway
            .publish_connect(connect_msg("dev", "key"))
            .await
            .unwrap();
        eventually("connect", || exchange.registry().contains("dev")).await;

        exchange.stop().await;
        assert!(!exchange.registry().contains("dev"));
        assert!(exchange.registry().is_empty());

        // second stop is a no-op
        exchange.stop().await;

        // events published after stop are not processed
        gateway
            .publish_connect(connect_msg("dev", "key"))
            .await
            .unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(!exchange.registry().contains("dev"));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (exchange, _gateway, _ttn) = started().await;
        assert!(matches!(
            exchange.start(1, Duration::from_millis(10)).await,
            Err(Error::AlreadyRunning)
        ));
        exchange.stop().await;
    }

    #[tokio::test]
    async fn empty_gateway_id_is_dropped() {
        let (exchange, gateway, _ttn) = started().await;

        gateway.publish_connect(connect_msg("", "key")).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(exchange.registry().is_empty());

        exchange.stop().await;
    }

    struct FailingNorthbound;

    #[async_trait]
    impl Northbound for FailingNorthbound {
        async fn connect(&self) -> backend::Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> backend::Result<()> {
            Ok(())
        }

        async fn publish_uplink(&self, _msg: UplinkMessage) -> backend::Result<()> {
            Err(backend::Error::Transport("injected failure".to_string()))
        }

        async fn publish_status(&self, _msg: StatusMessage) -> backend::Result<()> {
            Err(backend::Error::Transport("injected failure".to_string()))
        }

        async fn subscribe_downlink(
            &self,
            _id: &GatewayId,
        ) -> backend::Result<MessageStream<DownlinkMessage>> {
            let (tx, rx) = mpsc::channel(1);
            std::mem::forget(tx);
            Ok(rx)
        }

        async fn unsubscribe_downlink(&self, _id: &GatewayId) -> backend::Result<()> {
            Ok(())
        }

        async fn cleanup_gateway(&self, _id: &GatewayId) {}
    }

    #[tokio::test]
    async fn publish_failure_does_not_stop_the_pipeline() {
        let ttn = Arc::new(DummyBackend::new("ttn"));
        let gateway = Arc::new(DummyBackend::new("gateway"));
        let mut exchange = Exchange::with_config(Arc::new(MemoryAuthStore::new()), fast_config());
        exchange.add_southbound(gateway.clone());
        exchange.add_northbound(Arc::new(FailingNorthbound));
        exchange.add_northbound(ttn.clone());
        let exchange = Arc::new(exchange);
        exchange.start(1, Duration::from_millis(10)).await.unwrap();

        connect_and_settle(&exchange, &gateway, "dev", "").await;

        let mut rx = ttn.subscribe_uplink(&"dev".to_string()).await.unwrap();
        gateway
            .publish_uplink(UplinkMessage {
                gateway_id: "dev".to_string(),
                payload: Bytes::from_static(b"frame"),
            })
            .await
            .unwrap();

        // the healthy northbound still receives it
        let msg = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("uplink should survive the failing backend")
            .unwrap();
        assert_eq!(msg.gateway_id, "dev");

        exchange.stop().await;
    }

    #[tokio::test]
    async fn gateways_are_isolated_from_each_other() {
        let (exchange, gateway, ttn) = started().await;
        connect_and_settle(&exchange, &gateway, "a", "").await;
        connect_and_settle(&exchange, &gateway, "b", "").await;

        gateway
            .publish_disconnect(disconnect_msg("a", ""))
            .await
            .unwrap();
        eventually("disconnect of a", || !exchange.registry().contains("a")).await;
        assert!(exchange.registry().contains("b"));

        let mut rx = ttn.subscribe_uplink(&"b".to_string()).await.unwrap();
        gateway
            .publish_uplink(UplinkMessage {
                gateway_id: "b".to_string(),
                payload: Bytes::from_static(b"frame"),
            })
            .await
            .unwrap();

        let msg = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("b should keep relaying after a disconnected")
            .unwrap();
        assert_eq!(msg.gateway_id, "b");

        exchange.stop().await;
    }
}

//! In-memory backend used by tests and the loopback binary.
//!
//! Implements both sides of the contract on fan-out tables, so one instance
//! can play the gateway substrate and another the router substrate.
//! Delivery is best-effort: full subscriber channels drop the message,
//! closed ones are pruned on the next publish.

use crate::error::Result;
use crate::traits::{MessageStream, Northbound, Southbound};
use async_trait::async_trait;
use common::{
    ConnectMessage, DisconnectMessage, DownlinkMessage, GatewayId, StatusMessage, UplinkMessage,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 16;

type GatewaySenders<T> = DashMap<GatewayId, Vec<mpsc::Sender<T>>>;

pub struct DummyBackend {
    name: String,
    connected: AtomicBool,
    connect_subs: Mutex<Vec<mpsc::Sender<ConnectMessage>>>,
    disconnect_subs: Mutex<Vec<mpsc::Sender<DisconnectMessage>>>,
    uplink_subs: GatewaySenders<UplinkMessage>,
    status_subs: GatewaySenders<StatusMessage>,
    downlink_subs: GatewaySenders<DownlinkMessage>,
}

impl DummyBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: AtomicBool::new(false),
            connect_subs: Mutex::new(Vec::new()),
            disconnect_subs: Mutex::new(Vec::new()),
            uplink_subs: DashMap::new(),
            status_subs: DashMap::new(),
            downlink_subs: DashMap::new(),
        }
    }

    fn fan_out_events<T: Clone>(&self, subs: &Mutex<Vec<mpsc::Sender<T>>>, msg: T, what: &str) {
        let mut senders = subs.lock().expect("subscriber list poisoned");
        senders.retain(|tx| !tx.is_closed());
        for tx in senders.iter() {
            if tx.try_send(msg.clone()).is_err() {
                warn!(backend = %self.name, what, "subscriber channel full, dropping event");
            }
        }
    }

    fn fan_out_gateway<T: Clone>(&self, subs: &GatewaySenders<T>, id: &GatewayId, msg: T, what: &str) {
        let Some(mut senders) = subs.get_mut(id) else {
            debug!(backend = %self.name, gateway_id = %id, what, "no subscribers");
            return;
        };
        senders.retain(|tx| !tx.is_closed());
        for tx in senders.iter() {
            if tx.try_send(msg.clone()).is_err() {
                warn!(backend = %self.name, gateway_id = %id, what, "subscriber channel full, dropping message");
            }
        }
    }

    fn subscribe_gateway<T>(&self, subs: &GatewaySenders<T>, id: &GatewayId) -> MessageStream<T> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        subs.entry(id.clone()).or_default().push(tx);
        rx
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn drop_gateway(&self, id: &GatewayId) {
        self.uplink_subs.remove(id);
        self.status_subs.remove(id);
        self.downlink_subs.remove(id);
    }
}

#[async_trait]
impl Southbound for DummyBackend {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        debug!(backend = %self.name, "connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        debug!(backend = %self.name, "disconnected");
        Ok(())
    }

    async fn publish_connect(&self, msg: ConnectMessage) -> Result<()> {
        self.fan_out_events(&self.connect_subs, msg, "connect");
        Ok(())
    }

    async fn publish_disconnect(&self, msg: DisconnectMessage) -> Result<()> {
        self.fan_out_events(&self.disconnect_subs, msg, "disconnect");
        Ok(())
    }

    async fn subscribe_connect(&self) -> Result<MessageStream<ConnectMessage>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.connect_subs
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        Ok(rx)
    }

    async fn subscribe_disconnect(&self) -> Result<MessageStream<DisconnectMessage>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.disconnect_subs
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        Ok(rx)
    }

    async fn subscribe_uplink(&self, id: &GatewayId) -> Result<MessageStream<UplinkMessage>> {
        Ok(self.subscribe_gateway(&self.uplink_subs, id))
    }

    async fn subscribe_status(&self, id: &GatewayId) -> Result<MessageStream<StatusMessage>> {
        Ok(self.subscribe_gateway(&self.status_subs, id))
    }

    async fn publish_downlink(&self, msg: DownlinkMessage) -> Result<()> {
        let id = msg.gateway_id.clone();
        self.fan_out_gateway(&self.downlink_subs, &id, msg, "downlink");
        Ok(())
    }

    async fn cleanup_gateway(&self, id: &GatewayId) {
        self.drop_gateway(id);
    }
}

#[async_trait]
impl Northbound for DummyBackend {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        debug!(backend = %self.name, "connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        debug!(backend = %self.name, "disconnected");
        Ok(())
    }

    async fn publish_uplink(&self, msg: UplinkMessage) -> Result<()> {
        let id = msg.gateway_id.clone();
        self.fan_out_gateway(&self.uplink_subs, &id, msg, "uplink");
        Ok(())
    }

    async fn publish_status(&self, msg: StatusMessage) -> Result<()> {
        let id = msg.gateway_id.clone();
        self.fan_out_gateway(&self.status_subs, &id, msg, "status");
        Ok(())
    }

    async fn subscribe_downlink(&self, id: &GatewayId) -> Result<MessageStream<DownlinkMessage>> {
        Ok(self.subscribe_gateway(&self.downlink_subs, id))
    }

    async fn unsubscribe_downlink(&self, id: &GatewayId) -> Result<()> {
        self.downlink_subs.remove(id);
        Ok(())
    }

    async fn cleanup_gateway(&self, id: &GatewayId) {
        self.drop_gateway(id);
    }
}

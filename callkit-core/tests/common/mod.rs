//! Shared fixtures: participants wired to one loopback network

#![allow(dead_code)]

use callkit_core::loopback::{
    LoopbackDevices, LoopbackHub, LoopbackNetwork, LoopbackRelayServer, RecordOp,
    RecordingCallRecords,
};
use callkit_core::prelude::*;
use callkit_core::CallEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub struct Participant {
    pub id: MemberId,
    pub controller: CallSessionController,
    pub devices: Arc<LoopbackDevices>,
    pub records: Arc<RecordingCallRecords>,
    pub events: broadcast::Receiver<CallEvent>,
    pub listener: JoinHandle<()>,
}

impl Participant {
    pub fn state(&self) -> Option<CallState> {
        self.controller.state()
    }

    pub fn call_id(&self) -> CallId {
        self.controller.call_id().unwrap()
    }

    pub fn member_ids(&self) -> Vec<MemberId> {
        self.controller
            .members()
            .into_iter()
            .map(|m| m.member_id)
            .collect()
    }

    pub fn record_ops(&self) -> Vec<RecordOp> {
        self.records.ops()
    }

    /// Events received so far, without waiting
    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub struct TestNet {
    pub hub: Arc<LoopbackHub>,
    pub network: Arc<LoopbackNetwork>,
    pub relay: Arc<LoopbackRelayServer>,
    pub chat: ChatId,
}

impl TestNet {
    pub fn new() -> Self {
        init_tracing();
        Self {
            hub: LoopbackHub::new(),
            network: LoopbackNetwork::new(),
            relay: LoopbackRelayServer::new(),
            chat: ChatId::new("chat-1"),
        }
    }

    pub fn join(&self, name: &str) -> Participant {
        self.join_with(name, CallConfig::default())
    }

    pub fn join_with(&self, name: &str, config: CallConfig) -> Participant {
        let id = MemberId::new(name);
        let (gateway, inbox) = self.hub.register(id.clone());
        self.hub.join(&self.chat, &id);

        let devices = Arc::new(LoopbackDevices::new());
        let records = Arc::new(RecordingCallRecords::new());
        let controller = CallSessionController::builder(id.clone())
            .with_config(config)
            .with_signaling(gateway)
            .with_records(records.clone())
            .with_devices(devices.clone())
            .with_peer_transport(self.network.transport(id.clone()))
            .with_relay_connector(self.relay.connector(id.clone()))
            .build()
            .unwrap();
        let events = controller.subscribe_events();
        let listener = controller.spawn_signal_listener(inbox);

        Participant {
            id,
            controller,
            devices,
            records,
            events,
            listener,
        }
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds, for up to five seconds
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Place a direct call from `caller` and have `callee` answer it
pub async fn connect_direct(caller: &Participant, callee: &Participant, options: CallOptions) -> CallId {
    let call_id = caller
        .controller
        .start_call(ChatId::new("chat-1"), options)
        .await
        .unwrap();
    assert!(eventually(|| callee.controller.call_id() == Some(call_id)).await);
    callee.controller.accept_call().await.unwrap();
    assert!(eventually(|| caller.state() == Some(CallState::Connected)).await);
    assert!(eventually(|| callee.state() == Some(CallState::Connected)).await);
    call_id
}

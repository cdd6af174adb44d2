//! Shared fixtures for engine integration tests

#![allow(dead_code)]

use boardmon_core::{AppConfig, AutoConnect, DeviceRegistry, Engine, EngineEvent, VirtualBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Engine wired to a virtual bus, with a lossless event feed
pub struct Rig {
    pub bus: Arc<VirtualBus>,
    pub engine: Arc<Engine>,
    pub events: UnboundedReceiver<EngineEvent>,
}

impl Rig {
    pub fn new(config: AppConfig) -> Self {
        let bus = Arc::new(VirtualBus::new());
        let engine = Engine::new(config, DeviceRegistry::builtin(), bus.clone(), bus.clone());
        let events = engine.subscribe_lossless();
        Self { bus, engine, events }
    }

    /// Next event accepted by `pred`, skipping the rest
    pub async fn next_event<F>(&mut self, within: Duration, mut pred: F) -> Option<EngineEvent>
    where
        F: FnMut(&EngineEvent) -> bool,
    {
        tokio::time::timeout(within, async {
            while let Some(event) = self.events.recv().await {
                if pred(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    }

    /// Drain what is queued right now
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Config that connects to everything without boot delays
pub fn quick_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.discovery.auto_connect = AutoConnect::Always;
    config.session.apply_boot_delay = false;
    config.session.idle_after_ms = 0;
    config
}

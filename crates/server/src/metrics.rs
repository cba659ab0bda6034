#![cfg(feature = "metrics")]

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    pub open_chat_sockets: IntGauge,
    pub messages_delivered_total: IntCounter,
    pub messages_rejected_total: IntCounterVec,
    pub db_ready: IntGauge,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "gymdesk_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let open_chat_sockets = IntGauge::new(
            "gymdesk_open_chat_sockets",
            "Currently open chat WebSocket connections",
        )?;
        registry.register(Box::new(open_chat_sockets.clone()))?;

        let messages_delivered_total = IntCounter::new(
            "gymdesk_messages_delivered_total",
            "Messages persisted and republished to connected clients",
        )?;
        registry.register(Box::new(messages_delivered_total.clone()))?;

        let messages_rejected_total = IntCounterVec::new(
            Opts::new(
                "gymdesk_messages_rejected_total",
                "Message frames rejected before persistence, labeled by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(messages_rejected_total.clone()))?;

        let db_ready = IntGauge::new(
            "gymdesk_db_ready",
            "Whether the database connection is established (1) or not (0)",
        )?;
        registry.register(Box::new(db_ready.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            open_chat_sockets,
            messages_delivered_total,
            messages_rejected_total,
            db_ready,
        }))
    }

    pub fn set_db_ready(&self, ready: bool) {
        self.db_ready.set(i64::from(ready));
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

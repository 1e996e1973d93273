//! Notification fan-out across delivery channels.
//!
//! This module provides:
//! - Channel adapter traits for push, SMS, email, webhook, and chat
//! - A router that fans one message out to the requested channels
//! - Severity-driven channel selection
//! - Delivery logging to the audit sink
//!
//! A channel is only attempted when the recipient carries the matching
//! address; adapters for channels nobody registered report an error in the
//! per-channel results rather than failing the whole send.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::{Recipient, RecipientRole};
use crate::error::{DispatchError, DispatchResult};
use crate::stores::{topics, AuditSink};

/// Maximum message-body prefix persisted in delivery logs.
const LOGGED_BODY_PREFIX: usize = 100;

/// Message severity, ordered from least to most pressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Informational.
    Low,
    /// Routine operational message.
    Normal,
    /// Needs prompt attention.
    Urgent,
    /// Needs immediate attention.
    Critical,
}

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Mobile push.
    Push,
    /// SMS text.
    Sms,
    /// Email.
    Email,
    /// HTTP webhook.
    Webhook,
    /// In-app chat.
    Chat,
}

impl Channel {
    fn address_present(&self, recipient: &Recipient) -> bool {
        match self {
            Channel::Push => recipient.push_token.is_some(),
            Channel::Sms => recipient.phone.is_some(),
            Channel::Email => recipient.email.is_some(),
            Channel::Webhook => recipient.webhook_url.is_some(),
            Channel::Chat => recipient.chat_id.is_some(),
        }
    }
}

/// A message to deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Short title.
    pub title: String,

    /// Full body.
    pub body: String,
}

impl Message {
    /// Create a message.
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// Outcome for one attempted channel.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelResult {
    /// The channel attempted.
    pub channel: Channel,

    /// Whether delivery succeeded.
    pub ok: bool,

    /// Error detail when it did not.
    pub error: Option<String>,
}

/// Aggregated outcome of one send.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    /// Per-channel outcomes in request order.
    pub results: Vec<ChannelResult>,

    /// Whether at least one channel delivered.
    pub successful: bool,
}

/// Adapter for one delivery channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// The channel this adapter serves.
    fn channel(&self) -> Channel;

    /// Deliver `message` to `recipient`.
    async fn deliver(&self, recipient: &Recipient, message: &Message) -> DispatchResult<()>;
}

/// Routes messages to channel adapters and logs delivery outcomes.
pub struct Notifier {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
    sink: Arc<dyn AuditSink>,
}

impl Notifier {
    /// Create a notifier with no adapters registered.
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            adapters: HashMap::new(),
            sink,
        }
    }

    /// Register an adapter, replacing any previous one for its channel.
    pub fn register_adapter(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.channel(), adapter);
    }

    /// Send `message` to `recipient` over `channels`, aggregating
    /// per-channel outcomes and persisting a delivery log. Channels whose
    /// address is missing or whose adapter is unregistered report errors in
    /// the results; the send as a whole succeeds if any channel delivered.
    pub async fn send(
        &self,
        recipient: &Recipient,
        message: &Message,
        severity: Severity,
        channels: &[Channel],
    ) -> DeliveryReport {
        let mut results = Vec::with_capacity(channels.len());

        for channel in channels {
            if !channel.address_present(recipient) {
                results.push(ChannelResult {
                    channel: *channel,
                    ok: false,
                    error: Some("recipient has no address for channel".into()),
                });
                continue;
            }

            let outcome = match self.adapters.get(channel) {
                Some(adapter) => adapter.deliver(recipient, message).await,
                None => Err(DispatchError::internal("no adapter registered")),
            };

            results.push(match outcome {
                Ok(()) => ChannelResult {
                    channel: *channel,
                    ok: true,
                    error: None,
                },
                Err(err) => {
                    tracing::warn!(channel = ?channel, recipient = %recipient.id, error = %err, "delivery failed");
                    ChannelResult {
                        channel: *channel,
                        ok: false,
                        error: Some(err.to_string()),
                    }
                }
            });
        }

        let report = DeliveryReport {
            successful: results.iter().any(|r| r.ok),
            results,
        };
        self.log_delivery(recipient, message, severity, &report).await;
        report
    }

    /// The channels worth using for `recipient` at `severity`: push when a
    /// token is on file, SMS for urgent and critical, email for critical,
    /// chat for operators.
    pub fn optimal_channels(&self, recipient: &Recipient, severity: Severity) -> Vec<Channel> {
        let mut channels = Vec::new();
        if recipient.push_token.is_some() {
            channels.push(Channel::Push);
        }
        if severity >= Severity::Urgent && recipient.phone.is_some() {
            channels.push(Channel::Sms);
        }
        if severity == Severity::Critical && recipient.email.is_some() {
            channels.push(Channel::Email);
        }
        if recipient.role == RecipientRole::Admin {
            channels.push(Channel::Chat);
        }
        channels.dedup();
        channels
    }

    async fn log_delivery(
        &self,
        recipient: &Recipient,
        message: &Message,
        severity: Severity,
        report: &DeliveryReport,
    ) {
        let body_prefix: String = message.body.chars().take(LOGGED_BODY_PREFIX).collect();
        let record = serde_json::json!({
            "recipient_id": recipient.id,
            "role": recipient.role,
            "title": message.title,
            "body_prefix": body_prefix,
            "severity": severity,
            "results": report.results,
            "instant": Utc::now(),
            "successful": report.successful,
        });
        if let Err(err) = self.sink.append(topics::NOTIFICATION_LOGS, record).await {
            tracing::warn!(error = %err, "failed to persist delivery log");
        }
    }
}

// ============================================================================
// Built-in adapters
// ============================================================================

/// Adapter that logs deliveries to the console. Useful for local runs.
pub struct ConsoleAdapter {
    channel: Channel,
}

impl ConsoleAdapter {
    /// Create a console adapter for `channel`.
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl ChannelAdapter for ConsoleAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn deliver(&self, recipient: &Recipient, message: &Message) -> DispatchResult<()> {
        tracing::info!(
            channel = ?self.channel,
            recipient = %recipient.id,
            title = %message.title,
            "notification delivered"
        );
        Ok(())
    }
}

/// Adapter that records deliveries in memory. Test double.
pub struct MemoryAdapter {
    channel: Channel,
    fail: bool,
    delivered: Mutex<Vec<(String, Message)>>,
}

impl MemoryAdapter {
    /// Create a recording adapter for `channel`.
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            fail: false,
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Create an adapter whose deliveries always fail.
    pub fn failing(channel: Channel) -> Self {
        Self {
            fail: true,
            ..Self::new(channel)
        }
    }

    /// Messages delivered so far, with recipient ids.
    pub fn delivered(&self) -> Vec<(String, Message)> {
        self.delivered.lock().clone()
    }
}

#[async_trait]
impl ChannelAdapter for MemoryAdapter {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn deliver(&self, recipient: &Recipient, message: &Message) -> DispatchResult<()> {
        if self.fail {
            return Err(DispatchError::transient("adapter offline"));
        }
        self.delivered
            .lock()
            .push((recipient.id.clone(), message.clone()));
        Ok(())
    }
}

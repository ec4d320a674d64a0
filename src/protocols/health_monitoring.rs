//! # Health Monitoring Protocol
//!
//! Heartbeats and on-demand health checks over `health:checks`.
//!
//! Every heartbeat or health-check response updates the `agent_id -> AgentHealth`
//! map and is appended to a bounded history; the oldest records are evicted once
//! the configured capacity is reached. Agents that stop sending heartbeats for
//! longer than the heartbeat timeout count as stale.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::errors::{ProtocolError, ProtocolResult};
use super::handler::{attach, ProtocolContext, ProtocolHandler};
use super::message::{CommunicationPattern, ProtocolAction, ProtocolMessage};
use crate::config::HealthConfig;
use crate::constants::streams;
use crate::messaging::{ForeignTargetPolicy, GroupStart, Payload, SubscribeOptions, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl AgentHealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }

    /// Interpret a reported status, including worker lifecycle states
    pub fn from_reported(status: &str) -> Self {
        match status {
            "healthy" | "idle" | "busy" | "initializing" => Self::Healthy,
            "degraded" | "shutting_down" => Self::Degraded,
            "unhealthy" | "error" => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for AgentHealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: String,
    pub status: AgentHealthStatus,
    /// Status as reported by the agent, before interpretation
    pub reported_status: String,
    pub last_heartbeat: DateTime<Utc>,
    pub metrics: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub agent_id: String,
    pub status: AgentHealthStatus,
    pub action: ProtocolAction,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub status: AgentHealthStatus,
    pub total_agents: usize,
    pub healthy_agents: usize,
    pub unhealthy_agents: usize,
    pub stale_agents: Vec<String>,
    pub agents: Vec<AgentHealth>,
    pub checked_at: DateTime<Utc>,
}

/// Produces this agent's answer to health-check requests
#[async_trait]
pub trait HealthReporter: Send + Sync + 'static {
    async fn health_report(&self) -> anyhow::Result<(AgentHealthStatus, Payload)>;
}

pub struct HealthMonitoringProtocol {
    context: ProtocolContext,
    config: HealthConfig,
    agents: RwLock<HashMap<String, AgentHealth>>,
    history: Mutex<VecDeque<HealthRecord>>,
    reporter: Option<Arc<dyn HealthReporter>>,
    subscription: tokio::sync::Mutex<Option<SubscriptionId>>,
}

impl fmt::Debug for HealthMonitoringProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitoringProtocol")
            .field("agent_id", &self.context.agent_id())
            .field("tracked_agents", &self.agents.read().len())
            .field("history", &self.history.lock().len())
            .finish()
    }
}

impl HealthMonitoringProtocol {
    pub fn new(context: ProtocolContext, config: HealthConfig) -> Self {
        Self {
            context,
            config,
            agents: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            reporter: None,
            subscription: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn HealthReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Read `health:checks` through a private group; targeted messages for other
    /// agents are discarded.
    pub async fn listen(self: &Arc<Self>) -> ProtocolResult<SubscriptionId> {
        let mut subscription = self.subscription.lock().await;
        if let Some(id) = subscription.as_ref() {
            return Ok(id.clone());
        }
        let agent_id = self.context.agent_id().to_string();
        let id = attach(
            self,
            streams::HEALTH_CHECKS,
            SubscribeOptions::new()
                .with_group(agent_id.clone())
                .with_consumer(agent_id.clone())
                .starting_at(GroupStart::Latest)
                .with_target_filter(agent_id, ForeignTargetPolicy::Discard),
        )
        .await?;
        info!(agent_id = %self.context.agent_id(), "Health monitoring listening");
        *subscription = Some(id.clone());
        Ok(id)
    }

    pub async fn close(&self) {
        if let Some(id) = self.subscription.lock().await.take() {
            self.context.bus().unsubscribe(&id).await;
        }
    }

    pub async fn send_heartbeat(&self, status: AgentHealthStatus, metrics: Payload) -> ProtocolResult<()> {
        let message = ProtocolMessage::new(
            ProtocolAction::Heartbeat,
            self.context.agent_id(),
            self.report_payload(status, metrics),
        );
        match self.context.send(streams::HEALTH_CHECKS, message).await? {
            Some(_) => Ok(()),
            None => Err(ProtocolError::rejected("outbound", "heartbeat rejected by middleware")),
        }
    }

    /// Ask one agent, or every agent when `target` is `None`, for a health report.
    ///
    /// Responses arrive asynchronously and merge into the status map. A failed
    /// targeted request marks that agent unhealthy.
    pub async fn request_health_check(&self, target: Option<&str>) -> ProtocolResult<String> {
        let correlation_id = Uuid::new_v4().to_string();
        let mut message = ProtocolMessage::new(
            ProtocolAction::HealthCheckRequest,
            self.context.agent_id(),
            Payload::new(),
        )
        .with_correlation(correlation_id.clone(), streams::HEALTH_CHECKS);
        if let Some(target) = target {
            message = message.with_target(target);
        }

        let outcome = match self.context.send(streams::HEALTH_CHECKS, message).await {
            Ok(Some(_)) => Ok(correlation_id),
            Ok(None) => Err(ProtocolError::rejected(
                "outbound",
                "health check request rejected by middleware",
            )),
            Err(e) => Err(e),
        };

        if let (Err(e), Some(target)) = (&outcome, target) {
            warn!(target_agent = %target, error = %e, "Health check request failed");
            let mut metrics = Payload::new();
            metrics.insert("error".to_string(), json!(e.to_string()));
            self.record(
                target,
                AgentHealthStatus::Unhealthy,
                AgentHealthStatus::Unhealthy.as_str().to_string(),
                metrics,
                ProtocolAction::HealthCheckResponse,
            );
        }
        outcome
    }

    pub fn get_agent_health(&self, agent_id: &str) -> Option<AgentHealth> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn history(&self) -> Vec<HealthRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Healthy only when every tracked agent is healthy and fresh; healthy with none
    pub fn get_system_health(&self) -> SystemHealth {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout())
            .unwrap_or_else(|_| chrono::Duration::days(3650));

        let mut agents: Vec<AgentHealth> = self.agents.read().values().cloned().collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let stale_agents: Vec<String> = agents
            .iter()
            .filter(|agent| now - agent.last_heartbeat > timeout)
            .map(|agent| agent.agent_id.clone())
            .collect();
        let healthy_agents = agents
            .iter()
            .filter(|agent| agent.status == AgentHealthStatus::Healthy)
            .count();
        let unhealthy_agents = agents
            .iter()
            .filter(|agent| agent.status == AgentHealthStatus::Unhealthy)
            .count();

        let status = if healthy_agents == agents.len() && stale_agents.is_empty() {
            AgentHealthStatus::Healthy
        } else {
            AgentHealthStatus::Degraded
        };

        SystemHealth {
            status,
            total_agents: agents.len(),
            healthy_agents,
            unhealthy_agents,
            stale_agents,
            agents,
            checked_at: now,
        }
    }

    fn report_payload(&self, status: AgentHealthStatus, metrics: Payload) -> Payload {
        let mut payload = Payload::new();
        payload.insert("agent_id".to_string(), json!(self.context.agent_id()));
        payload.insert("status".to_string(), json!(status.as_str()));
        payload.insert("metrics".to_string(), Value::Object(metrics));
        payload
    }

    fn record(
        &self,
        agent_id: &str,
        status: AgentHealthStatus,
        reported_status: String,
        metrics: Payload,
        action: ProtocolAction,
    ) {
        let now = Utc::now();
        self.agents.write().insert(
            agent_id.to_string(),
            AgentHealth {
                agent_id: agent_id.to_string(),
                status,
                reported_status,
                last_heartbeat: now,
                metrics,
            },
        );

        let mut history = self.history.lock();
        history.push_back(HealthRecord {
            agent_id: agent_id.to_string(),
            status,
            action,
            recorded_at: now,
        });
        while history.len() > self.config.history_size.max(1) {
            history.pop_front();
        }
    }

    fn absorb_report(&self, message: &ProtocolMessage) {
        let payload = message.payload();
        let agent_id = payload
            .get("agent_id")
            .or_else(|| payload.get("worker_id"))
            .and_then(Value::as_str)
            .unwrap_or_else(|| message.source());
        let reported = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let metrics = payload
            .get("metrics")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let status = AgentHealthStatus::from_reported(&reported);
        debug!(agent_id = %agent_id, status = %status, action = %message.action, "Health report received");
        self.record(agent_id, status, reported, metrics, message.action);
    }

    async fn answer_check(&self, request: &ProtocolMessage) -> Option<ProtocolMessage> {
        let reporter = self.reporter.as_ref()?;
        let (status, metrics) = match reporter.health_report().await {
            Ok(report) => report,
            Err(e) => {
                let mut metrics = Payload::new();
                metrics.insert("error".to_string(), json!(e.to_string()));
                (AgentHealthStatus::Unhealthy, metrics)
            }
        };
        Some(request.reply(
            self.context.agent_id(),
            ProtocolAction::HealthCheckResponse,
            self.report_payload(status, metrics),
        ))
    }
}

#[async_trait]
impl ProtocolHandler for HealthMonitoringProtocol {
    fn pattern(&self) -> CommunicationPattern {
        CommunicationPattern::HealthMonitoring
    }

    fn context(&self) -> &ProtocolContext {
        &self.context
    }

    async fn handle_message(
        &self,
        message: ProtocolMessage,
    ) -> ProtocolResult<Option<ProtocolMessage>> {
        match message.action {
            ProtocolAction::Heartbeat | ProtocolAction::HealthCheckResponse => {
                self.absorb_report(&message);
                Ok(None)
            }
            ProtocolAction::HealthCheckRequest => Ok(self.answer_check(&message).await),
            action => Err(ProtocolError::unsupported(self.pattern(), action)),
        }
    }
}

//! Domain event vocabulary and bus channel routing
//!
//! All in-flight events live in one sum type ([`BusEvent`]) so the WebSocket
//! fan-out can match exhaustively. Events are serialized as JSON with an
//! `event_type` tag equal to the bus channel name.

pub mod publisher;
pub mod subscriber;

pub use publisher::EventPublisher;
pub use subscriber::run_subscriber;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{AnomalySeverity, AnomalyType, JobStatus, ModelType};

// ============================================================================
// Channels
// ============================================================================

/// The six pub/sub channels of the event bus contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusChannel {
    AnomalyDetected,
    MetricUpdated,
    TrainingStarted,
    TrainingProgress,
    TrainingCompleted,
    SystemAlert,
}

impl BusChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AnomalyDetected => "anomaly.detected",
            Self::MetricUpdated => "metric.updated",
            Self::TrainingStarted => "training.started",
            Self::TrainingProgress => "training.progress",
            Self::TrainingCompleted => "training.completed",
            Self::SystemAlert => "system.alert",
        }
    }

    pub fn all() -> [Self; 6] {
        [
            Self::AnomalyDetected,
            Self::MetricUpdated,
            Self::TrainingStarted,
            Self::TrainingProgress,
            Self::TrainingCompleted,
            Self::SystemAlert,
        ]
    }
}

impl std::fmt::Display for BusChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Events
// ============================================================================

/// Fit statistics attached to a successful `training.completed` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingMetrics {
    pub model_version: i32,
    pub r_squared: f64,
    pub rmse: f64,
    pub mae: f64,
}

/// Every event the core publishes or consumes. The serde tag doubles as the
/// bus channel name, so `serde_json::from_str` on a raw bus payload yields
/// the right variant without a channel lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type")]
pub enum BusEvent {
    #[serde(rename = "anomaly.detected")]
    AnomalyDetected {
        machine_id: String,
        metric: String,
        value: f64,
        expected: f64,
        severity: AnomalySeverity,
        anomaly_type: AnomalyType,
        confidence: f64,
        timestamp: DateTime<Utc>,
        published_at: DateTime<Utc>,
    },
    #[serde(rename = "metric.updated")]
    MetricUpdated {
        machine_id: String,
        metric: String,
        value: f64,
        timestamp: DateTime<Utc>,
        published_at: DateTime<Utc>,
    },
    #[serde(rename = "training.started")]
    TrainingStarted {
        job_id: Uuid,
        machine_id: String,
        model_type: ModelType,
        published_at: DateTime<Utc>,
    },
    #[serde(rename = "training.progress")]
    TrainingProgress {
        job_id: Uuid,
        progress_pct: f64,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        published_at: DateTime<Utc>,
    },
    #[serde(rename = "training.completed")]
    TrainingCompleted {
        job_id: Uuid,
        status: JobStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        metrics: Option<TrainingMetrics>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
        published_at: DateTime<Utc>,
    },
    #[serde(rename = "system.alert")]
    SystemAlert {
        alert_type: String,
        severity: AnomalySeverity,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
        published_at: DateTime<Utc>,
    },
}

impl BusEvent {
    /// The channel this event is published on.
    pub fn channel(&self) -> BusChannel {
        match self {
            Self::AnomalyDetected { .. } => BusChannel::AnomalyDetected,
            Self::MetricUpdated { .. } => BusChannel::MetricUpdated,
            Self::TrainingStarted { .. } => BusChannel::TrainingStarted,
            Self::TrainingProgress { .. } => BusChannel::TrainingProgress,
            Self::TrainingCompleted { .. } => BusChannel::TrainingCompleted,
            Self::SystemAlert { .. } => BusChannel::SystemAlert,
        }
    }
}

// ============================================================================
// WebSocket Topics
// ============================================================================

/// The four broadcast topics exposed under `/ws/{topic}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WsTopic {
    Dashboard,
    Anomalies,
    Training,
    Events,
}

impl WsTopic {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dashboard => "dashboard",
            Self::Anomalies => "anomalies",
            Self::Training => "training",
            Self::Events => "events",
        }
    }

    pub fn all() -> [Self; 4] {
        [Self::Dashboard, Self::Anomalies, Self::Training, Self::Events]
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dashboard" => Some(Self::Dashboard),
            "anomalies" => Some(Self::Anomalies),
            "training" => Some(Self::Training),
            "events" => Some(Self::Events),
            _ => None,
        }
    }

    /// Whether this topic forwards events from `channel`.
    pub fn subscribes_to(self, channel: BusChannel) -> bool {
        match self {
            Self::Dashboard => matches!(
                channel,
                BusChannel::AnomalyDetected
                    | BusChannel::MetricUpdated
                    | BusChannel::TrainingCompleted
            ),
            Self::Anomalies => matches!(channel, BusChannel::AnomalyDetected),
            Self::Training => matches!(
                channel,
                BusChannel::TrainingStarted
                    | BusChannel::TrainingProgress
                    | BusChannel::TrainingCompleted
            ),
            Self::Events => matches!(channel, BusChannel::SystemAlert),
        }
    }

    /// Envelope `type` for an event delivered on this topic. The dashboard
    /// receives `training.completed` as `model_updated`.
    pub fn envelope_type(self, event: &BusEvent) -> &'static str {
        match (self, event.channel()) {
            (Self::Dashboard, BusChannel::TrainingCompleted) => "model_updated",
            (_, channel) => channel.as_str(),
        }
    }
}

impl std::fmt::Display for WsTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wrap an event in the `{type, data}` envelope sent over a topic socket.
pub fn envelope(topic: WsTopic, event: &BusEvent) -> serde_json::Value {
    serde_json::json!({
        "type": topic.envelope_type(event),
        "data": event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_anomaly_event() -> BusEvent {
        BusEvent::AnomalyDetected {
            machine_id: "Compressor-1".into(),
            metric: "power_kw".into(),
            value: 92.0,
            expected: 70.0,
            severity: AnomalySeverity::Warning,
            anomaly_type: AnomalyType::Spike,
            confidence: 0.87,
            timestamp: Utc::now(),
            published_at: Utc::now(),
        }
    }

    #[test]
    fn event_type_tag_equals_channel_name() {
        let event = sample_anomaly_event();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "anomaly.detected");
        assert_eq!(json["event_type"], event.channel().as_str());
    }

    #[test]
    fn raw_payload_round_trips_without_channel_lookup() {
        let event = BusEvent::TrainingCompleted {
            job_id: Uuid::new_v4(),
            status: JobStatus::Succeeded,
            metrics: Some(TrainingMetrics {
                model_version: 3,
                r_squared: 0.91,
                rmse: 2.4,
                mae: 1.9,
            }),
            error_message: None,
            published_at: Utc::now(),
        };
        let raw = serde_json::to_string(&event).unwrap();
        let parsed: BusEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn topic_routing_table() {
        use BusChannel as C;
        use WsTopic as T;

        // dashboard: anomalies + metrics + completed trainings
        assert!(T::Dashboard.subscribes_to(C::AnomalyDetected));
        assert!(T::Dashboard.subscribes_to(C::MetricUpdated));
        assert!(T::Dashboard.subscribes_to(C::TrainingCompleted));
        assert!(!T::Dashboard.subscribes_to(C::TrainingStarted));
        assert!(!T::Dashboard.subscribes_to(C::SystemAlert));

        // anomalies: only anomaly.detected
        assert!(T::Anomalies.subscribes_to(C::AnomalyDetected));
        assert!(!T::Anomalies.subscribes_to(C::MetricUpdated));

        // training: all three training channels
        assert!(T::Training.subscribes_to(C::TrainingStarted));
        assert!(T::Training.subscribes_to(C::TrainingProgress));
        assert!(T::Training.subscribes_to(C::TrainingCompleted));
        assert!(!T::Training.subscribes_to(C::AnomalyDetected));

        // events: only system alerts
        assert!(T::Events.subscribes_to(C::SystemAlert));
        assert!(!T::Events.subscribes_to(C::AnomalyDetected));
    }

    #[test]
    fn dashboard_renames_training_completed() {
        let event = BusEvent::TrainingCompleted {
            job_id: Uuid::new_v4(),
            status: JobStatus::Succeeded,
            metrics: None,
            error_message: None,
            published_at: Utc::now(),
        };
        assert_eq!(WsTopic::Dashboard.envelope_type(&event), "model_updated");
        assert_eq!(WsTopic::Training.envelope_type(&event), "training.completed");

        let env = envelope(WsTopic::Dashboard, &event);
        assert_eq!(env["type"], "model_updated");
        assert_eq!(env["data"]["event_type"], "training.completed");
    }

    #[test]
    fn every_channel_reaches_at_least_one_topic() {
        for channel in BusChannel::all() {
            assert!(
                WsTopic::all().iter().any(|t| t.subscribes_to(channel)),
                "channel {channel} has no subscribing topic"
            );
        }
    }
}

//! Fan-out completeness: every published event reaches every client of every
//! subscribing topic, in the documented envelope, unless the client's sink
//! overflowed.

use chrono::Utc;
use uuid::Uuid;

use enms_analytics::events::{BusEvent, TrainingMetrics, WsTopic};
use enms_analytics::types::{AnomalySeverity, AnomalyType, JobStatus};
use enms_analytics::ws::{FanoutRegistry, CLIENT_QUEUE_CAPACITY};

fn anomaly_event() -> BusEvent {
    BusEvent::AnomalyDetected {
        machine_id: "Compressor-1".into(),
        metric: "power_kw".into(),
        value: 95.0,
        expected: 71.0,
        severity: AnomalySeverity::Critical,
        anomaly_type: AnomalyType::Spike,
        confidence: 0.93,
        timestamp: Utc::now(),
        published_at: Utc::now(),
    }
}

fn training_completed() -> BusEvent {
    BusEvent::TrainingCompleted {
        job_id: Uuid::new_v4(),
        status: JobStatus::Succeeded,
        metrics: Some(TrainingMetrics {
            model_version: 4,
            r_squared: 0.92,
            rmse: 1.8,
            mae: 1.3,
        }),
        error_message: None,
        published_at: Utc::now(),
    }
}

#[tokio::test]
async fn every_subscribing_client_receives_the_event() {
    let registry = FanoutRegistry::new(64);
    let mut dash_a = registry.register(WsTopic::Dashboard, "dash-a").unwrap();
    let mut dash_b = registry.register(WsTopic::Dashboard, "dash-b").unwrap();
    let mut anomalies = registry.register(WsTopic::Anomalies, "anom").unwrap();
    let mut events = registry.register(WsTopic::Events, "events").unwrap();

    registry.dispatch(&anomaly_event());

    for rx in [&mut dash_a, &mut dash_b, &mut anomalies] {
        let frame: serde_json::Value =
            serde_json::from_str(&rx.try_recv().expect("frame expected")).unwrap();
        assert_eq!(frame["type"], "anomaly.detected");
        assert_eq!(frame["data"]["machine_id"], "Compressor-1");
        assert_eq!(frame["data"]["severity"], "critical");
    }
    // the events topic only carries system alerts
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn dashboard_sees_completed_training_as_model_updated() {
    let registry = FanoutRegistry::new(64);
    let mut dashboard = registry.register(WsTopic::Dashboard, "d").unwrap();
    let mut training = registry.register(WsTopic::Training, "t").unwrap();

    registry.dispatch(&training_completed());

    let dash_frame: serde_json::Value =
        serde_json::from_str(&dashboard.try_recv().unwrap()).unwrap();
    let train_frame: serde_json::Value =
        serde_json::from_str(&training.try_recv().unwrap()).unwrap();

    assert_eq!(dash_frame["type"], "model_updated");
    assert_eq!(train_frame["type"], "training.completed");
    // same payload under both envelopes
    assert_eq!(
        dash_frame["data"]["metrics"]["r_squared"],
        train_frame["data"]["metrics"]["r_squared"]
    );
}

#[tokio::test]
async fn per_client_order_is_preserved() {
    let registry = FanoutRegistry::new(64);
    let mut rx = registry.register(WsTopic::Training, "ordered").unwrap();

    for version in 1..=5 {
        registry.dispatch(&BusEvent::TrainingProgress {
            job_id: Uuid::nil(),
            progress_pct: f64::from(version) * 20.0,
            status: JobStatus::Running,
            message: None,
            published_at: Utc::now(),
        });
    }

    let mut last = -1.0;
    for _ in 0..5 {
        let frame: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        let pct = frame["data"]["progress_pct"].as_f64().unwrap();
        assert!(pct > last, "frames out of order");
        last = pct;
    }
}

#[tokio::test]
async fn overflow_drops_only_the_slow_client() {
    let registry = FanoutRegistry::new(64);
    let _slow = registry.register(WsTopic::Anomalies, "slow").unwrap(); // never drained
    let mut fast = registry.register(WsTopic::Anomalies, "fast").unwrap();

    for _ in 0..=CLIENT_QUEUE_CAPACITY {
        registry.dispatch(&anomaly_event());
        // the fast client keeps draining
        while fast.try_recv().is_ok() {}
    }

    // slow was dropped at overflow; fast is still registered
    assert_eq!(registry.connection_count(), 1);
    registry.dispatch(&anomaly_event());
    assert!(fast.try_recv().is_ok());
}

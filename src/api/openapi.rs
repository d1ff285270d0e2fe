//! OpenAPI document assembly (utoipa)

use utoipa::OpenApi;

use crate::api::handlers::{
    anomaly, baseline, health, kpi, machines, ovos, scheduler, stats, timeseries,
};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "EnMS Analytics Service",
        description = "Energy baselines, anomaly detection, KPIs and real-time event fan-out \
                       for factory telemetry."
    ),
    paths(
        health::get_health,
        machines::list_machines,
        machines::get_machine,
        machines::machine_status,
        machines::list_seus,
        machines::list_energy_sources,
        timeseries::series,
        timeseries::latest,
        timeseries::multi_machine_energy,
        kpi::all_kpis,
        kpi::single_kpi,
        baseline::list_models,
        baseline::get_model,
        baseline::train,
        baseline::predict,
        baseline::deviation,
        baseline::performance,
        anomaly::recent,
        anomaly::active,
        anomaly::detect,
        anomaly::create,
        anomaly::resolve,
        ovos::train_baseline,
        ovos::available_features,
        scheduler::status,
        scheduler::trigger,
        stats::connections,
    ),
    components(schemas(
        crate::types::Machine,
        crate::types::EnergySource,
        crate::types::EnergySourceFeature,
        crate::types::Seu,
        crate::types::BaselineModel,
        crate::types::TrainingJob,
        crate::types::Anomaly,
        crate::types::AnomalyType,
        crate::types::AnomalySeverity,
        crate::types::AnomalyStatus,
        crate::types::KpiSet,
        crate::types::KpiValue,
        crate::types::Granularity,
        health::HealthResponse,
        machines::MachineStatusResponse,
        timeseries::SeriesResponse,
        timeseries::MultiMachineResponse,
        kpi::SingleKpiResponse,
        baseline::TrainRequest,
        baseline::TrainResponse,
        baseline::PredictRequest,
        baseline::PerformanceResponse,
        anomaly::DetectRequest,
        anomaly::CreateRequest,
        anomaly::CreateResponse,
        anomaly::ResolveRequest,
        ovos::OvosTrainRequest,
        ovos::OvosTrainResponse,
        ovos::AvailableFeaturesResponse,
        scheduler::SchedulerStatusResponse,
        stats::ConnectionStats,
    )),
    tags(
        (name = "enms-analytics", description = "EnMS Analytics Service API")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_builds_and_lists_core_paths() {
        let doc = ApiDoc::openapi();
        let json = serde_json::to_value(&doc).unwrap();
        let paths = json["paths"].as_object().unwrap();

        for expected in [
            "/api/v1/health",
            "/api/v1/machines",
            "/api/v1/baseline/train",
            "/api/v1/anomaly/recent",
            "/api/v1/kpi/all",
            "/api/v1/scheduler/status",
        ] {
            assert!(paths.contains_key(expected), "missing path {expected}");
        }
    }
}

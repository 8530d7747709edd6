use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use dbguard_api::{
    logging, DbGuardApi, DbGuardConfig, PeriodicScheduler, StatusReport, API_CONTRACT_VERSION,
};
use dbguard_core::{CheckResult, MonitorError, Policy, PolicyForm};
use serde::Serialize;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Clone)]
struct ServiceState {
    api: DbGuardApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct PolicyResponse {
    policy: Option<Policy>,
}

#[derive(Debug, Parser)]
#[command(name = "dbguard-service")]
#[command(about = "Local HTTP service and weekly scheduler for dbguard")]
struct Args {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    settings_db: Option<PathBuf>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<MonitorError> for ServiceError {
    fn from(err: MonitorError) -> Self {
        // Failures reaching or reading the monitored server are upstream errors.
        let status = match err {
            MonitorError::Connection(_) | MonitorError::UnexpectedResult(_) => {
                StatusCode::BAD_GATEWAY
            }
            MonitorError::Notification(_) | MonitorError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ServiceState::error(status, err.to_string())
    }
}

impl ServiceState {
    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status))
        .route("/v1/check", post(check))
        .route("/v1/policy", get(policy_show).put(policy_update))
        .with_state(state)
}

fn load_config(args: &Args) -> Result<DbGuardConfig> {
    let mut config = DbGuardConfig::load_or_default(args.config.as_deref())?;
    if let Some(settings_db) = &args.settings_db {
        config.settings_db.clone_from(settings_db);
    }
    if let Some(database_url) = &args.database_url {
        config.database_url.clone_from(database_url);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init_tracing()?;
    let config = load_config(&args)?;
    let api = DbGuardApi::from_config(&config)?;

    if let Err(err) = api.activate().await {
        tracing::warn!(error = %err, "activation failed; retrying on the first scheduled run");
    }

    let scheduler = PeriodicScheduler::new(config.schedule.cadence());
    let job_api = api.clone();
    let registered = scheduler.register(move || {
        let api = job_api.clone();
        async move {
            if let Err(err) = api.run_scheduled().await {
                tracing::error!(error = %err, "scheduled check failed");
            }
        }
    });
    if !registered {
        return Err(anyhow!("failed to register the periodic check"));
    }

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, "dbguard service listening");
    let served = axum::serve(listener, app(ServiceState { api }))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    scheduler.unregister();
    served.context("service terminated with an error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn status(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<StatusReport>>, ServiceError> {
    let report = state.api.status()?;
    Ok(Json(envelope(report)))
}

async fn check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<CheckResult>>, ServiceError> {
    let result = state.api.run_on_demand().await?;
    Ok(Json(envelope(result)))
}

async fn policy_show(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<PolicyResponse>>, ServiceError> {
    let policy = state.api.policy()?;
    Ok(Json(envelope(PolicyResponse { policy })))
}

async fn policy_update(
    State(state): State<ServiceState>,
    Json(form): Json<PolicyForm>,
) -> Result<Json<ServiceEnvelope<PolicyResponse>>, ServiceError> {
    let policy = state.api.update_policy(form)?;
    Ok(Json(envelope(PolicyResponse { policy: Some(policy) })))
}

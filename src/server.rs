//! HTTP surface: the CRM posts activity changes here.
use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    Form, Json, Router,
    extract::{State, rejection::FormRejection},
    http::StatusCode,
    routing::{get, post},
};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    activity::{ActivityEvent, ActivityForm},
    manager::{ManagerError, ReconcileOutcome, WorkerManager},
    worker::WorkerState,
};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<WorkerManager>,
}

#[derive(Debug, Serialize)]
pub struct ActivityResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ReconcileOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActivityResponse {
    fn ok(outcome: ReconcileOutcome) -> Self {
        Self {
            success: true,
            outcome: Some(outcome),
            error: None,
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            outcome: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub workers: usize,
    pub states: HashMap<String, WorkerState>,
}

pub fn router(manager: Arc<WorkerManager>) -> Router {
    Router::new()
        .route("/actions/activity", post(handle_activity))
        .route("/health", get(handle_health))
        .with_state(AppState { manager })
}

/// Serve until `shutdown` resolves. Workers are left alone; stopping them is
/// the caller's job.
pub async fn serve<F>(addr: SocketAddr, manager: Arc<WorkerManager>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!("Activity endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(manager))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

type Reply = (StatusCode, Json<ActivityResponse>);

async fn handle_activity(
    State(state): State<AppState>,
    form: Result<Form<ActivityForm>, FormRejection>,
) -> Reply {
    let Form(form) = match form {
        Ok(form) => form,
        Err(rejection) => {
            warn!("Unreadable activity form: {rejection}");
            return (StatusCode::BAD_REQUEST, Json(ActivityResponse::failed(rejection.body_text())));
        }
    };

    let event = match ActivityEvent::try_from(form) {
        Ok(event) => event,
        Err(err) => {
            warn!("Rejected activity form: {err}");
            return (StatusCode::BAD_REQUEST, Json(ActivityResponse::failed(err)));
        }
    };

    match state.manager.reconcile(&event).await {
        Ok(outcome) => (StatusCode::OK, Json(ActivityResponse::ok(outcome))),
        Err(err @ ManagerError::Activity(_)) => (StatusCode::BAD_REQUEST, Json(ActivityResponse::failed(err))),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(ActivityResponse::failed(err))),
    }
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let states = state.manager.diagnostics();
    Json(HealthResponse {
        workers: states.len(),
        states,
    })
}

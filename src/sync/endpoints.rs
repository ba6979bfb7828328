//! The JSON endpoints for triggering syncs and reading the sync history.

use axum::{
    Json,
    extract::{FromRef, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{
    AppState,
    bank_connection::BankConnectionId,
    sync::{SyncOrchestrator, SyncTrigger},
};

/// The state needed to run syncs.
#[derive(Clone)]
pub struct SyncState {
    orchestrator: SyncOrchestrator,
}

impl FromRef<AppState> for SyncState {
    fn from_ref(state: &AppState) -> Self {
        Self {
            orchestrator: state.orchestrator.clone(),
        }
    }
}

/// A route handler that runs a manual sync and responds with the [crate::SyncResult].
///
/// The status code reflects the outcome, e.g. 409 Conflict when a sync is
/// already running and 403 Forbidden when the user must re-authorize the
/// connection. The body is the sync result either way.
pub async fn sync_connection_endpoint(
    State(state): State<SyncState>,
    Path(bank_connection_id): Path<BankConnectionId>,
) -> Response {
    let result = state
        .orchestrator
        .run_sync(bank_connection_id, SyncTrigger::Manual)
        .await;

    let status = result
        .error
        .as_ref()
        .map(|error| error.status_code())
        .unwrap_or(StatusCode::OK);

    (status, Json(result)).into_response()
}

/// A route handler that responds with the sync history of a connection, newest first.
pub async fn get_sync_history_endpoint(
    State(state): State<SyncState>,
    Path(bank_connection_id): Path<BankConnectionId>,
) -> Response {
    match state.orchestrator.get_sync_history(bank_connection_id) {
        Ok(history) => Json(history).into_response(),
        Err(error) => {
            tracing::debug!(
                "Could not get sync history for connection {bank_connection_id}: {error}"
            );
            error.into_response()
        }
    }
}

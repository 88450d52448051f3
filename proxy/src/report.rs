use axum::{extract::State, response::IntoResponse};
use bytes::Bytes;
use layerlift_delta::{
    optimizer::PriorityTable,
    trace::TraceCollection,
    wire::{PROTOCOL_VERSION, VERSION_HEADER},
};
use tracing::{info, instrument};

use crate::{errors::AppError, AppState};

/// Folds reported traces into the priority tables of their collections.
#[instrument(skip_all, fields(report.len = body.len()))]
pub async fn post(State(state): State<AppState>, body: Bytes) -> Result<impl IntoResponse, AppError> {
    let traces = TraceCollection::from_json(&body)?;

    let mut groups = 0;
    let mut ranked = 0;
    for group in traces.groups.iter().filter(|g| !g.images.is_empty()) {
        let collection = state.catalog.load(&group.images).await?;
        let update = PriorityTable::from_trace(&collection, group);
        ranked += update.len();
        groups += 1;

        state
            .catalog
            .store()
            .merge_priorities(&collection.signature(), update)
            .await?;
    }

    info!(report.groups = groups, report.ranked = ranked, "merged traces");

    Ok((
        [(VERSION_HEADER, PROTOCOL_VERSION)],
        format!("Optimized: {} groups, {} contents ranked\n", groups, ranked),
    ))
}

use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use layerlift_delta::{
    wire::{PROTOCOL_VERSION, VERSION_HEADER},
    ImageRef,
};
use tracing::instrument;

use crate::{errors::AppError, AppState};

#[instrument(skip(state))]
pub async fn get(
    Path(image): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let image: ImageRef = image.parse()?;
    let collection = state.catalog.prepare(&image).await?;

    Ok((
        [(VERSION_HEADER, PROTOCOL_VERSION)],
        format!(
            "Cached TOC: {} ({} entries, {} contents)\n",
            image,
            collection.len(),
            collection.contents().len()
        ),
    ))
}

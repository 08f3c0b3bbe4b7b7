use std::{sync::Arc, time::Instant};

use axum::{
    Json,
    extract::{Multipart, State, multipart::MultipartRejection},
};
use serde::Serialize;

use super::{AppState, error::AppError};
use crate::{pipeline::PredictError, types::PredictionLabel};

/// Multipart field carrying the image.
pub const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Serialize)]
pub struct PredictionResponse {
    pub prediction: PredictionLabel,
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn predict(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, AppError> {
    let started = Instant::now();
    let result = async {
        let bytes = read_upload(multipart?).await?;
        let label = state.pool.predict(bytes).await?;
        Ok::<_, AppError>(label)
    }
    .await;

    let latency = started.elapsed().as_millis();
    match &result {
        Ok(label) => log::info!("predict -> {label} in {latency} ms"),
        Err(err) => log::info!(
            "predict -> {} {} in {latency} ms",
            err.status().as_u16(),
            err.code()
        ),
    }

    result.map(|prediction| Json(PredictionResponse { prediction }))
}

async fn read_upload(mut multipart: Multipart) -> Result<Vec<u8>, AppError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(UPLOAD_FIELD) {
            return Ok(field.bytes().await?.to_vec());
        }
    }
    Err(PredictError::MissingFile.into())
}

mod error;
mod handlers;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};

use crate::{config::Config, pipeline::WorkerPool};

pub struct AppState {
    pub pool: WorkerPool,
}

pub struct RouterOptions<'a> {
    pub allowed_origin: &'a str,
    pub max_upload_bytes: usize,
}

impl<'a> From<&'a Config> for RouterOptions<'a> {
    fn from(cfg: &'a Config) -> Self {
        Self {
            allowed_origin: &cfg.allowed_origin,
            max_upload_bytes: cfg.max_upload_bytes,
        }
    }
}

pub fn router(state: Arc<AppState>, opts: RouterOptions<'_>) -> Result<Router> {
    let origin: HeaderValue = opts
        .allowed_origin
        .parse()
        .with_context(|| format!("invalid CORS origin {:?}", opts.allowed_origin))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any);

    Ok(Router::new()
        .route("/predict", post(handlers::predict))
        .route("/predict/", post(handlers::predict))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(opts.max_upload_bytes))
        .layer(cors)
        .with_state(state))
}

pub async fn serve(cfg: &Config, pool: WorkerPool) -> Result<()> {
    let state = Arc::new(AppState { pool });
    let app = router(state, RouterOptions::from(cfg))?;

    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.bind_addr))?;
    log::info!(
        "listening on {} (CORS origin {})",
        cfg.bind_addr,
        cfg.allowed_origin
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    log::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    log::info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::pipeline::{
        WorkerPoolConfig,
        testing::{FakeDetector, RecordingClassifier, hand, png_bytes},
    };

    const BOUNDARY: &str = "X-ASL-BOUNDARY";
    const ORIGIN: &str = "http://localhost:3000";

    fn app_with(hands: usize, classifier: RecordingClassifier) -> Router {
        app_with_limit(hands, classifier, 1024 * 1024)
    }

    fn app_with_limit(
        hands: usize,
        classifier: RecordingClassifier,
        max_upload_bytes: usize,
    ) -> Router {
        let pool = WorkerPool::start(
            &WorkerPoolConfig {
                workers: 1,
                queue_depth: 4,
                request_timeout: Duration::from_secs(5),
            },
            move |_| {
                Ok((
                    FakeDetector {
                        hands: (0..hands).map(|_| hand(0.5)).collect(),
                        fail: false,
                    },
                    classifier.clone(),
                ))
            },
        )
        .unwrap();

        router(
            Arc::new(AppState { pool }),
            RouterOptions {
                allowed_origin: ORIGIN,
                max_upload_bytes,
            },
        )
        .unwrap()
    }

    fn multipart_request(field: &str, payload: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{field}\"; filename=\"frame.png\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/predict")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn predict_returns_label() {
        let classifier = RecordingClassifier::new("A");
        let app = app_with(1, classifier.clone());

        let response = app
            .oneshot(multipart_request("file", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!({"prediction": "A"}));
        assert_eq!(classifier.calls(), 1);
    }

    #[tokio::test]
    async fn trailing_slash_route_is_served() {
        let app = app_with(2, RecordingClassifier::new("W"));
        let mut request = multipart_request("file", &png_bytes());
        *request.uri_mut() = "/predict/".parse().unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["prediction"], "W");
    }

    #[tokio::test]
    async fn non_image_upload_is_a_decode_error() {
        let classifier = RecordingClassifier::new("A");
        let app = app_with(1, classifier.clone());

        let response = app
            .oneshot(multipart_request("file", b"%PDF-1.4 not an image"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(response).await["code"], "decode_error");
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn empty_frame_reports_no_hand() {
        let app = app_with(0, RecordingClassifier::new("A"));

        let response = app
            .oneshot(multipart_request("file", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(response).await;
        assert_eq!(body["code"], "no_hand_detected");
        assert_eq!(body["detail"], "no hand detected in image");
    }

    #[tokio::test]
    async fn missing_file_field_is_rejected() {
        let app = app_with(1, RecordingClassifier::new("A"));

        let response = app
            .oneshot(multipart_request("picture", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "missing_file");
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let classifier = RecordingClassifier::new("A");
        let app = app_with_limit(1, classifier.clone(), 64);

        let response = app
            .oneshot(multipart_request("file", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json_body(response).await["code"], "payload_too_large");
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn non_multipart_body_is_rejected() {
        let app = app_with(1, RecordingClassifier::new("A"));
        let request = Request::builder()
            .method("POST")
            .uri("/predict")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert!(response.status().is_client_error());
        assert_eq!(json_body(response).await["code"], "invalid_multipart");
    }

    #[tokio::test]
    async fn configured_origin_is_allowed() {
        let app = app_with(1, RecordingClassifier::new("A"));
        let request = Request::builder()
            .method("GET")
            .uri("/health")
            .header(header::ORIGIN, ORIGIN)
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            ORIGIN
        );
    }

    #[test]
    fn invalid_origin_is_a_startup_error() {
        let pool = WorkerPool::start(
            &WorkerPoolConfig {
                workers: 1,
                queue_depth: 1,
                request_timeout: Duration::from_secs(1),
            },
            |_| {
                Ok((
                    FakeDetector {
                        hands: Vec::new(),
                        fail: false,
                    },
                    RecordingClassifier::new("A"),
                ))
            },
        )
        .unwrap();

        let result = router(
            Arc::new(AppState { pool }),
            RouterOptions {
                allowed_origin: "bad\norigin",
                max_upload_bytes: 1,
            },
        );
        assert!(result.is_err());
    }
}

//! HTTP routes.
//!
//! Bodies are read as raw bytes and parsed by the handlers, so malformed JSON
//! takes the same `500 {"error": ...}` path as every other failure. Engine work is
//! blocking and runs on the blocking thread pool.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use ember_core::{
    EngineError, GenerationRequest, GenerationResponse, IndexRequest, InitRequest, ServiceContext,
    CHAT_DEFAULT_TEMPERATURE, QUERY_DEFAULT_TEMPERATURE,
};
use serde::de::DeserializeOwned;
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ServerError;

type AppState = Arc<ServiceContext>;

/// `OPTIONS` on any path, known or not, answers 204. Every response carries
/// permissive CORS headers.
pub fn build(service: AppState) -> Router {
    let any = HeaderValue::from_static("*");
    Router::new()
        .route("/v1/chat/completions", post(chat_completions).options(preflight))
        .route("/api/init", post(init).options(preflight))
        .route("/api/index", post(index).options(preflight))
        .route("/api/query", post(query).options(preflight))
        .fallback(not_found)
        .layer(SetResponseHeaderLayer::overriding(header::ACCESS_CONTROL_ALLOW_ORIGIN, any.clone()))
        .layer(SetResponseHeaderLayer::overriding(header::ACCESS_CONTROL_ALLOW_METHODS, any.clone()))
        .layer(SetResponseHeaderLayer::overriding(header::ACCESS_CONTROL_ALLOW_HEADERS, any))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn not_found(method: Method) -> Response {
    if method == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, ServerError> {
    serde_json::from_slice(body).map_err(|e| ServerError::Engine(EngineError::from(e)))
}

async fn chat_completions(State(service): State<AppState>, body: Bytes) -> Result<Json<GenerationResponse>, ServerError> {
    generate(service, body, CHAT_DEFAULT_TEMPERATURE).await
}

async fn query(State(service): State<AppState>, body: Bytes) -> Result<Json<GenerationResponse>, ServerError> {
    generate(service, body, QUERY_DEFAULT_TEMPERATURE).await
}

async fn generate(service: AppState, body: Bytes, default_temperature: f64) -> Result<Json<GenerationResponse>, ServerError> {
    let request = GenerationRequest::from_json(&body)?;
    info!(
        messages = request.messages.len(),
        max_tokens = request.max_tokens,
        directory = ?request.directory,
        "generation request"
    );
    let response = tokio::task::spawn_blocking(move || service.query(&request, default_temperature)).await??;
    Ok(Json(response))
}

async fn init(State(service): State<AppState>, body: Bytes) -> Result<Json<serde_json::Value>, ServerError> {
    let InitRequest { model } = parse(&body)?;
    info!(%model, "init request");
    let model = tokio::task::spawn_blocking(move || service.init(&model)).await??;
    Ok(Json(json!({ "model": model })))
}

async fn index(State(service): State<AppState>, body: Bytes) -> Result<Json<serde_json::Value>, ServerError> {
    let IndexRequest { directory } = parse(&body)?;
    info!(%directory, "index request");
    let summary = tokio::task::spawn_blocking(move || service.index(&directory)).await??;
    Ok(Json(json!({ "directory": summary.directory })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use ember_core::testing::scripted_model;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const VOCAB: &[&str] = &["Paris", "is", "the", "capital", "of", "France"];

    fn app() -> (Router, AppState) {
        let service = Arc::new(ServiceContext::default());
        (build(Arc::clone(&service)), service)
    }

    fn loaded_app() -> Router {
        let (router, service) = app();
        service.install(scripted_model(VOCAB, &["Paris", "is", "the", "capital", "of", "France"]));
        router
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn assert_cors(response: &Response) {
        for name in [
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            header::ACCESS_CONTROL_ALLOW_METHODS,
            header::ACCESS_CONTROL_ALLOW_HEADERS,
        ] {
            assert_eq!(response.headers()[&name], "*", "{name}");
        }
    }

    #[tokio::test]
    async fn test_options_is_204_with_cors() {
        for uri in ["/v1/chat/completions", "/api/query", "/anything/else"] {
            let (router, _) = app();
            let request = Request::builder().method(Method::OPTIONS).uri(uri).body(Body::empty()).unwrap();
            let response = router.oneshot(request).await.unwrap();

            assert_eq!(response.status(), StatusCode::NO_CONTENT, "{uri}");
            assert_cors(&response);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert!(body.is_empty());
        }
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let (router, _) = app();
        let response = router.oneshot(post_json("/v2/nothing", json!({}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_cors(&response);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"Not Found");
    }

    #[tokio::test]
    async fn test_chat_completion() {
        let request = post_json(
            "/v1/chat/completions",
            json!({
                "messages": [{"role": "user", "content": "hi"}],
                "max_tokens": 5,
                "temperature": 0
            }),
        );
        let response = loaded_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_cors(&response);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

        let json = body_json(response).await;
        assert!(json["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["model"], "scripted-model");
        assert_eq!(json["choices"][0]["message"]["role"], "assistant");
        assert_eq!(json["choices"][0]["message"]["content"], "Paris is the capital of");
        assert!(json["usage"]["completion_tokens"].as_u64().unwrap() <= 5);
    }

    #[tokio::test]
    async fn test_query_before_init_is_500() {
        let (router, _) = app();
        let request = post_json("/api/query", json!({"messages": [{"role": "user", "content": "hi"}]}));
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_cors(&response);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("No model loaded"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_500() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/v1/chat/completions")
            .body(Body::from("{not json"))
            .unwrap();
        let response = loaded_app().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().starts_with("Malformed request"));
    }

    #[tokio::test]
    async fn test_failed_init_is_500() {
        let (router, _) = app();
        let empty = tempfile::tempdir().unwrap();
        let request = post_json("/api/init", json!({"model": empty.path()}));
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().starts_with("Failed to load model"));
    }

    #[tokio::test]
    async fn test_index_then_query() {
        let (router, service) = app();
        service.install(scripted_model(VOCAB, &["Paris"]));

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("france.txt"), "Paris is the capital of France.").unwrap();
        let directory = dir.path().display().to_string();

        let response = router
            .clone()
            .oneshot(post_json("/api/index", json!({ "directory": directory })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["directory"], directory);

        let request = post_json(
            "/api/query",
            json!({
                "messages": [{"role": "user", "content": "What is the capital of France?"}],
                "max_tokens": 3,
                "directory": directory,
            }),
        );
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["choices"][0]["message"]["content"], "Paris Paris Paris");
        assert_eq!(json["usage"]["completion_tokens"], 3);
    }

    #[tokio::test]
    async fn test_index_missing_directory_is_500() {
        let (router, service) = app();
        service.install(scripted_model(VOCAB, &["Paris"]));
        let request = post_json("/api/index", json!({"directory": "/definitely/not/here"}));
        let response = router.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("Directory not found"));
    }
}

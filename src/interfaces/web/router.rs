use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{status, webhooks};
use super::{AppState, MAX_BODY_BYTES};

pub fn build_webhook_router(state: AppState) -> Router {
    Router::new()
        .route("/hook/{trigger_id}", post(webhooks::hook_endpoint))
        .route("/health", get(status::health_endpoint))
        .route("/status", get(status::status_endpoint))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::dispatcher::Dispatcher;
    use crate::core::profile::{Catalog, TriggerConfig, TriggerKind};
    use crate::core::state::{ProcessStatus, ProfileKey};
    use crate::core::test_support::{Fixture, profile, wait_for_status};
    use crate::interfaces::web::handlers::webhooks::sign_for_tests;
    use axum::http::{Method, StatusCode};
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn hook(id: &str, label: &str) -> TriggerConfig {
        TriggerConfig {
            trigger_id: id.into(),
            agent_id: "news".into(),
            profile_label: label.into(),
            kind: TriggerKind::Webhook,
            schedule_expr: None,
            watch_path: None,
            webhook_secret: None,
            enabled: true,
            cooldown_seconds: 0,
            debounce_seconds: 2,
            recursive: false,
            event_filter: None,
        }
    }

    fn fixture() -> (Fixture, Router) {
        let mut catalog = Catalog::default();
        catalog.put_profile(profile("news", "web", "sleep 30"));
        catalog.put_profile(profile("news", "sync", "sleep 30"));
        catalog.put_trigger(hook("deploy", "web"));

        let mut signed = hook("signed", "sync");
        signed.webhook_secret = Some("s3cret".into());
        catalog.put_trigger(signed);

        let mut pushes = hook("pushes", "sync");
        pushes.event_filter = Some("push".into());
        catalog.put_trigger(pushes);

        let mut off = hook("off", "web");
        off.enabled = false;
        catalog.put_trigger(off);

        let fx = Fixture::new(catalog);
        let dispatcher = Arc::new(Dispatcher::new(fx.supervisor.clone()));
        let app = build_webhook_router(AppState::new(dispatcher));
        (fx, app)
    }

    async fn send(
        app: &Router,
        method: Method,
        path: &str,
        headers: &[(&str, &str)],
        body: &'static [u8],
    ) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().method(method).uri(path);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let resp = app
            .clone()
            .oneshot(req.body(Body::from(body)).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    #[tokio::test]
    async fn unknown_or_disabled_trigger_is_not_found_and_leaves_no_trace() {
        let (fx, app) = fixture();
        for path in ["/hook/nope", "/hook/off"] {
            let (status, _) = send(&app, Method::POST, path, &[], b"{}").await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{path}");
        }
        let snapshot = fx.store.load().await.unwrap();
        assert!(snapshot.processes.is_empty());
        assert!(fx.store.history(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn accepted_then_conflict_while_running() {
        let (fx, app) = fixture();
        let (status, json) = send(&app, Method::POST, "/hook/deploy", &[], b"{}").await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["status"], "started");

        let (status, json) = send(&app, Method::POST, "/hook/deploy", &[], b"{}").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["status"], "already_running");

        fx.supervisor.stop("news", "web", "test").await.unwrap();
        wait_for_status(&fx.store, &ProfileKey::new("news", "web"), ProcessStatus::Stopped).await;
    }

    #[tokio::test]
    async fn secrets_are_enforced() {
        let (fx, app) = fixture();
        let (status, _) = send(&app, Method::POST, "/hook/signed", &[], b"{}").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(
            &app,
            Method::POST,
            "/hook/signed",
            &[("x-hub-signature-256", "sha256=deadbeef")],
            b"{}",
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(fx.store.history(None).await.unwrap().is_empty());

        let signature = format!("sha256={}", sign_for_tests("s3cret", b"{}"));
        let (status, _) = send(
            &app,
            Method::POST,
            "/hook/signed",
            &[("x-hub-signature-256", signature.as_str())],
            b"{}",
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        fx.supervisor.stop("news", "sync", "test").await.unwrap();
    }

    #[tokio::test]
    async fn shared_secret_header_is_accepted() {
        let (fx, app) = fixture();
        let (status, _) = send(
            &app,
            Method::POST,
            "/hook/signed",
            &[("x-webhook-secret", "s3cret")],
            b"{}",
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        fx.supervisor.stop("news", "sync", "test").await.unwrap();
    }

    #[tokio::test]
    async fn filtered_events_are_acknowledged_but_ignored() {
        let (fx, app) = fixture();
        let (status, json) = send(
            &app,
            Method::POST,
            "/hook/pushes",
            &[("x-github-event", "issues")],
            b"{}",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ignored");
        assert!(fx.store.history(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_state_is_service_unavailable() {
        let (fx, app) = fixture();
        std::fs::write(fx.store.state_path(), b"{ not json").unwrap();
        let (status, json) = send(&app, Method::POST, "/hook/deploy", &[], b"{}").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json["status"], "degraded");

        let (status, json) = send(&app, Method::GET, "/health", &[], b"").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["degraded"], true);
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let (_fx, app) = fixture();
        static BIG: [u8; MAX_BODY_BYTES + 1] = [b'x'; MAX_BODY_BYTES + 1];
        let (status, _) = send(&app, Method::POST, "/hook/deploy", &[], &BIG).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn status_lists_records() {
        let (fx, app) = fixture();
        fx.supervisor.start("news", "web").await.unwrap();
        let (status, json) = send(&app, Method::GET, "/status", &[], b"").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["degraded"], false);
        assert_eq!(json["processes"][0]["agent_id"], "news");
        assert_eq!(json["processes"][0]["alive"], true);
        fx.supervisor.stop("news", "web", "test").await.unwrap();
    }
}

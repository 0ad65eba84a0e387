pub mod error;
mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;

use crate::session::SessionRegistry;

pub use handlers::SessionInfo;
use handlers::*;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionRegistry,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/sessions", get(session_list).post(session_create))
        .route("/sessions/{id}", get(session_get).delete(session_delete));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api)
        .fallback(not_found)
        .with_state(state)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt; // for oneshot()

    use crate::session::ConnectionParams;

    fn create_test_state() -> AppState {
        AppState {
            sessions: SessionRegistry::new(),
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(create_test_state());

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_create_session() {
        let state = create_test_state();
        let app = router(state.clone());

        let response = app
            .oneshot(post_json(
                "/api/sessions",
                r#"{"host":"example.com","port":2222,"username":"alice","password":"hunter2"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["host"], "example.com");
        assert_eq!(json["port"], 2222);
        assert_eq!(json["username"], "alice");
        assert_eq!(json["has_credential"], true);
        assert_eq!(json["attached"], false);
        assert!(!json.to_string().contains("hunter2"));

        let id = json["id"].as_str().unwrap();
        let stored = state.sessions.lookup(id).unwrap();
        assert_eq!(stored.params.credential.expose(), "hunter2");
    }

    #[tokio::test]
    async fn test_create_session_default_port() {
        let app = router(create_test_state());
        let response = app
            .oneshot(post_json("/api/sessions", r#"{"host":"h","username":"u"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = body_json(response).await;
        assert_eq!(json["port"], 22);
        assert_eq!(json["has_credential"], false);
    }

    #[tokio::test]
    async fn test_create_session_invalid_params() {
        let app = router(create_test_state());
        let response = app
            .oneshot(post_json("/api/sessions", r#"{"host":"","username":"u"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_create_session_malformed_body() {
        let app = router(create_test_state());
        let response = app
            .oneshot(post_json("/api/sessions", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "invalid_request");
    }

    #[tokio::test]
    async fn test_get_and_list_sessions() {
        let state = create_test_state();
        let a = state.sessions.create(ConnectionParams::new("a.example", "u"));
        state.sessions.create(ConnectionParams::new("b.example", "u"));
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/sessions/{}", a.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["host"], "a.example");

        let response = app
            .oneshot(Request::builder().uri("/api/sessions").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_get_reports_attached_bridge() {
        let state = create_test_state();
        let session = state.sessions.create(ConnectionParams::new("h", "u"));
        let app = router(state.clone());
        let uri = format!("/api/sessions/{}", session.id);

        let response = app
            .clone()
            .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["attached"], false);
        assert!(json.get("attached_at").is_none());
        assert!(json.get("pid").is_none());

        let lease = state.sessions.acquire_bridge(&session.id).unwrap();
        lease.handle().set_pid(4242);
        let response = app
            .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["attached"], true);
        assert_eq!(json["pid"], 4242);
        let attached_at = json["attached_at"].as_u64().unwrap();
        assert!(attached_at >= json["created_at"].as_u64().unwrap());
        drop(lease);
    }

    #[tokio::test]
    async fn test_get_unknown_session() {
        let app = router(create_test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/sessions/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"]["code"], "session_not_found");
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let state = create_test_state();
        let session = state.sessions.create(ConnectionParams::new("h", "u"));
        let app = router(state.clone());

        for _ in 0..2 {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("DELETE")
                        .uri(format!("/api/sessions/{}", session.id))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }
        assert!(state.sessions.lookup(&session.id).is_none());
    }

    #[tokio::test]
    async fn test_delete_cancels_attached_bridge() {
        let state = create_test_state();
        let session = state.sessions.create(ConnectionParams::new("h", "u"));
        let lease = state.sessions.acquire_bridge(&session.id).unwrap();
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/sessions/{}", session.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(lease.handle().is_cancelled());
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let app = router(create_test_state());
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"]["code"], "not_found");
    }
}

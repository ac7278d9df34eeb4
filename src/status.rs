//! Read-only status endpoints for the surrounding application.
//!
//! - `GET /health`: liveness plus the Connected/Disconnected indicator
//! - `GET /api/v1/status`: full session snapshot (connection, presence, playback, metrics)

use crate::connection::ConnectionState;
use crate::session::SessionCoordinator;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .service(web::scope("/api/v1").route("/status", web::get().to(session_status)));
}

pub async fn health_check(session: web::Data<SessionCoordinator>) -> HttpResponse {
    let state = session.connection_state();
    let metrics = session.metrics();

    let status = match state {
        ConnectionState::Connected => "healthy",
        ConnectionState::Connecting | ConnectionState::Reconnecting => "degraded",
        ConnectionState::Disconnected | ConnectionState::Closed => "disconnected",
    };

    HttpResponse::Ok().json(json!({
        "status": status,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": metrics.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "session_id": session.session_id(),
        "connected": state == ConnectionState::Connected,
        "connection": state,
    }))
}

pub async fn session_status(session: web::Data<SessionCoordinator>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": session.status(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::device::mock::{MockInput, MockOutput};
    use crate::transport::mock::MockConnector;
    use actix_web::{test, App};
    use std::sync::Arc;

    fn session() -> SessionCoordinator {
        SessionCoordinator::new(
            &AppConfig::default(),
            Arc::new(MockConnector::new()),
            Arc::new(MockInput::new()),
            Arc::new(MockOutput::new()),
        )
        .unwrap()
    }

    #[actix_web::test]
    async fn test_health_reports_disconnected_before_connect() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(session()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "disconnected");
        assert_eq!(body["connected"], false);
        assert_eq!(body["connection"], "disconnected");
    }

    #[actix_web::test]
    async fn test_status_exposes_session_snapshot() {
        let session = Arc::new(session());
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(session.clone()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/status").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["session"]["session_id"], session.session_id().to_string());
        assert_eq!(body["session"]["presence_state"], "idle");
        assert_eq!(body["session"]["metrics"]["frames_sent"], 0);
    }
}

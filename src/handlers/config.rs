use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

const REDACTED: &str = "***";

/// Effective configuration as loaded at startup. The device token is never echoed.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = &state.config;
    let token = if config.backend.token.is_empty() { "" } else { REDACTED };

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port,
                "static_dir": config.server.static_dir
            },
            "proxy": {
                "host": config.proxy.host,
                "port": config.proxy.port,
                "public_url": config.proxy.public_url,
                "max_sessions": config.proxy.max_sessions,
                "max_message_size": config.proxy.max_message_size,
                "reconnect_queue_capacity": config.proxy.reconnect_queue_capacity,
                "idle_timeout_secs": config.proxy.idle_timeout_secs,
                "max_protocol_errors": config.proxy.max_protocol_errors
            },
            "backend": {
                "url": config.backend.url,
                "token": token,
                "enable_token": config.backend.enable_token,
                "device_id": config.backend.device_id,
                "client_id": config.backend.client_id,
                "protocol_version": config.backend.protocol_version,
                "connect_timeout_ms": config.backend.connect_timeout_ms
            },
            "reconnect": config.reconnect,
            "audio": config.audio
        }
    })))
}

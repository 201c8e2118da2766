use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::{info, warn};

/// Open and immediately close a WebSocket to the local proxy.
///
/// The connection goes through the normal accept path, so a successful test
/// also proves a session slot was available.
pub async fn test_connection(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let url = local_proxy_url(&state.config);
    let timeout = state.config.connect_timeout();

    let result = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await;
    match result {
        Ok(Ok((mut socket, _))) => {
            let _ = socket.close(None).await;
            info!(%url, "Proxy connection test succeeded");
            Ok(HttpResponse::Ok().json(json!({
                "status": "success",
                "message": "Connection test successful",
                "device_id": state.config.backend.device_id,
                "ws_url": url
            })))
        }
        Ok(Err(err)) => {
            warn!(%url, "Proxy connection test failed: {}", err);
            Err(AppError::Unavailable(format!("Connection test failed: {}", err)))
        }
        Err(_) => Err(AppError::Unavailable(format!(
            "Connection test failed: no answer from {} within {}ms",
            url,
            timeout.as_millis()
        ))),
    }
}

/// Loopback address of the proxy listener; wildcard binds are reached via localhost.
fn local_proxy_url(config: &AppConfig) -> String {
    let host = match config.proxy.host.as_str() {
        "" | "0.0.0.0" => "127.0.0.1",
        "::" => "[::1]",
        host => host,
    };
    format!("ws://{}:{}", host, config.proxy.port)
}

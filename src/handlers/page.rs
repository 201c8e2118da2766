use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use std::path::Path;

/// Serves the browser client with its connection settings filled in.
pub async fn index(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let path = Path::new(&state.config.server.static_dir).join("index.html");
    let template = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => AppError::NotFound(format!("{} not found", path.display())),
        _ => AppError::Internal(format!("failed to read {}: {}", path.display(), e)),
    })?;

    Ok(HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(render_index(&template, &state.config)))
}

/// Substitute the `{{name}}` placeholders the client page expects.
///
/// Values are HTML-escaped; they land in element text and attribute values.
pub fn render_index(template: &str, config: &AppConfig) -> String {
    template
        .replace("{{device_id}}", &escape_html(&config.backend.device_id))
        .replace("{{ws_url}}", &escape_html(&config.backend.url))
        .replace("{{local_proxy_url}}", &escape_html(&config.proxy.public_url))
        .replace("{{enable_token}}", if config.backend.enable_token { "true" } else { "false" })
}

fn escape_html(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::SessionRegistry;
    use actix_web::http::StatusCode;
    use actix_web::{test as actix_test, App};
    use std::sync::Arc;

    #[test]
    fn test_render_substitutes_placeholders() {
        let mut config = AppConfig::default();
        config.backend.device_id = "aa:bb:cc:dd:ee:ff".to_string();
        config.backend.enable_token = false;

        let page = render_index(
            "<b>{{device_id}}</b> {{ws_url}} {{local_proxy_url}} {{enable_token}} {{device_id}}",
            &config,
        );
        assert_eq!(
            page,
            "<b>aa:bb:cc:dd:ee:ff</b> ws://localhost:9005 ws://localhost:5002 false aa:bb:cc:dd:ee:ff"
        );
    }

    #[test]
    fn test_render_escapes_config_values() {
        let mut config = AppConfig::default();
        config.backend.device_id = "<script>alert(1)</script>".to_string();
        config.proxy.public_url = r#"ws://host/?a=1&b="x""#.to_string();

        let page = render_index(r#"<code>{{device_id}}</code><input value="{{local_proxy_url}}">"#, &config);
        assert_eq!(
            page,
            r#"<code>&lt;script&gt;alert(1)&lt;/script&gt;</code><input value="ws://host/?a=1&amp;b=&quot;x&quot;">"#
        );
    }

    #[actix_web::test]
    async fn test_missing_page_is_not_found() {
        let mut config = AppConfig::default();
        config.server.static_dir = std::env::temp_dir()
            .join(format!("missing-{}", uuid::Uuid::new_v4()))
            .display()
            .to_string();
        let state = AppState::new(Arc::new(config), Arc::new(SessionRegistry::new(1)));

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/", web::get().to(index)),
        )
        .await;
        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_page_is_rendered_from_static_dir() {
        let dir = std::env::temp_dir().join(format!("page-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("index.html"), "proxy={{local_proxy_url}}").unwrap();

        let mut config = AppConfig::default();
        config.server.static_dir = dir.display().to_string();
        let state = AppState::new(Arc::new(config), Arc::new(SessionRegistry::new(1)));

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/", web::get().to(index)),
        )
        .await;
        let body = actix_test::call_and_read_body(&app, actix_test::TestRequest::get().uri("/").to_request()).await;
        assert_eq!(body, "proxy=ws://localhost:5002");

        std::fs::remove_dir_all(dir).ok();
    }
}

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use salvo::conn::tcp::TcpAcceptor;
use salvo::http::Method;
use salvo::prelude::*;
use salvo::serve_static::StaticDir;
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::sync::oneshot;

use crate::broker::{Broker, PushMessage};
use crate::ratelimit::Limiter;
use crate::settings::Settings;
use crate::store;
use crate::Result;

//reject webhook bodies above this with 413
const MAX_BODY_SIZE: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub store: Arc<store::Manager>,
    pub limiter: Arc<Limiter>,
    pub settings: Settings,
}

pub fn route(state: AppState, web_dir: String) -> Router {
    Router::new()
        .hoop(affix_state::inject(state))
        .push(
            // the handler owns the method check so non-POST yields 405
            Router::with_path("webhook")
                .get(webhook)
                .post(webhook)
                .put(webhook)
                .delete(webhook)
                .patch(webhook),
        )
        .push(Router::with_path("messages").get(messages))
        .push(Router::with_path("status").get(status))
        .push(Router::with_path("health").get(health))
        .push(Router::with_path("{**rest}").get(StaticDir::new([web_dir]).defaults("index.html")))
}

pub async fn bind(laddr: SocketAddr) -> Result<TcpAcceptor> {
    let listener = tokio::net::TcpListener::bind(laddr).await?;
    let acceptor = TcpAcceptor::try_from(listener)?;
    Ok(acceptor)
}

pub async fn serve(
    acceptor: TcpAcceptor,
    state: AppState,
    web_dir: String,
    shutdown_rx: oneshot::Receiver<()>,
) -> Result<()> {
    let server = Server::new(acceptor);
    let handle = server.handle();
    tokio::spawn(async move {
        shutdown_rx.await.ok();
        handle.stop_graceful(None);
    });
    server.try_serve(route(state, web_dir)).await?;
    Ok(())
}

fn get_state(depot: &Depot) -> std::result::Result<&AppState, salvo::Error> {
    depot.obtain::<AppState>().map_err(|_| salvo::Error::other("server state missing"))
}

#[derive(Debug, Default, Deserialize)]
struct WebhookRequest {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    topic: String,
    #[serde(default)]
    extra: Option<serde_json::Value>,
    #[serde(default)]
    client: String,
}

#[handler]
async fn webhook(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
) -> std::result::Result<(), salvo::Error> {
    let state = get_state(depot)?;

    let client_addr = client_ip(req);
    if state.limiter.is_blocked(&client_addr) {
        log::warn!("request rejected, ip is blocked, ip: {client_addr}");
        send_error(res, StatusCode::TOO_MANY_REQUESTS, "too many requests, try again later");
        return Ok(());
    }

    if req.method() != Method::POST {
        log::warn!("webhook received non-POST request, method: {}", req.method());
        send_error(res, StatusCode::METHOD_NOT_ALLOWED, "only POST is supported");
        return Ok(());
    }

    if !token_valid(req, &state.settings.auth.token) {
        state.limiter.record_failure(&client_addr);
        log::warn!("webhook token validation failed, ip: {client_addr}");
        send_error(res, StatusCode::UNAUTHORIZED, "authentication failed");
        return Ok(());
    }
    state.limiter.record_success(&client_addr);

    let body = match req.payload().await {
        Ok(body) => body,
        Err(e) => {
            log::warn!("failed to read request body, {e:?}");
            send_error(res, StatusCode::BAD_REQUEST, "failed to read request body");
            return Ok(());
        }
    };
    if body.len() > MAX_BODY_SIZE {
        send_error(res, StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        return Ok(());
    }
    log::debug!("webhook request received, body_size: {}", body.len());

    // senders sometimes embed raw control characters in string literals
    let body = repair_json(body);

    let webhook_req: WebhookRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            log::warn!("webhook JSON parse failed, {e}");
            send_error(res, StatusCode::BAD_REQUEST, &format!("invalid JSON: {e}"));
            return Ok(());
        }
    };

    if webhook_req.content.is_empty() {
        log::warn!("webhook content field is empty");
        send_error(res, StatusCode::BAD_REQUEST, "content must not be empty");
        return Ok(());
    }

    let msg = PushMessage {
        title: webhook_req.title,
        content: webhook_req.content,
        extra: webhook_req.extra,
        timestamp: Utc::now(),
        client: webhook_req.client,
    };

    let topic = if webhook_req.topic.is_empty() {
        state.settings.mqtt.topic.clone()
    } else {
        webhook_req.topic
    };

    if let Err(e) = state.broker.publish(&topic, &msg).await {
        log::error!("message publish failed, topic: {topic}, {e:?}");
        send_error(res, StatusCode::INTERNAL_SERVER_ERROR, "message push failed");
        return Ok(());
    }

    let clients = state.broker.client_count().await;
    log::info!("message pushed, topic: {topic}, title: {:?}, clients: {clients}", msg.title);

    res.status_code(StatusCode::OK);
    res.render(Json(json!({
        "success": true,
        "message": "message pushed",
        "clients": clients,
    })));
    Ok(())
}

#[handler]
async fn messages(
    req: &mut Request,
    depot: &mut Depot,
    res: &mut Response,
) -> std::result::Result<(), salvo::Error> {
    let state = get_state(depot)?;

    let token = match extract_token(req) {
        Some(token) if constant_time_eq(&token, &state.settings.auth.token) => token,
        _ => {
            send_error(res, StatusCode::UNAUTHORIZED, "authentication failed");
            return Ok(());
        }
    };

    let page_size = req.query::<isize>("page_size").unwrap_or(0);
    let before_id = req.query::<u64>("before_id").unwrap_or(0);

    // the token is also the tenant selector
    match state.store.list(&token, before_id, page_size) {
        Ok(result) => {
            res.status_code(StatusCode::OK);
            res.render(Json(json!({ "success": true, "data": result })));
        }
        Err(e) => {
            send_error(res, StatusCode::INTERNAL_SERVER_ERROR, &format!("query failed: {e}"));
        }
    }
    Ok(())
}

#[handler]
async fn status(depot: &mut Depot, res: &mut Response) -> std::result::Result<(), salvo::Error> {
    let state = get_state(depot)?;
    let clients = state.broker.client_count().await;
    res.status_code(StatusCode::OK);
    res.render(Json(json!({ "status": "ok", "clients": clients })));
    Ok(())
}

#[handler]
async fn health(res: &mut Response) {
    res.status_code(StatusCode::OK);
    res.render(Json(json!({ "status": "ok" })));
}

fn send_error(res: &mut Response, status_code: StatusCode, message: &str) {
    res.status_code(status_code);
    res.render(Json(json!({ "success": false, "message": message })));
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

fn token_valid(req: &Request, token: &str) -> bool {
    match extract_token(req) {
        Some(candidate) => constant_time_eq(&candidate, token),
        None => false,
    }
}

/// Credential extraction order: `Authorization: Bearer <t>`, bare
/// `Authorization`, `X-Auth-Token`, `?token=`.
fn extract_token(req: &Request) -> Option<String> {
    if let Some(auth) = req.headers().get("authorization").and_then(|v| v.to_str().ok()) {
        if !auth.is_empty() {
            if let Some(bearer) = auth.strip_prefix("Bearer ") {
                return Some(bearer.to_string());
            }
            return Some(auth.to_string());
        }
    }

    if let Some(token) = req.headers().get("x-auth-token").and_then(|v| v.to_str().ok()) {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    req.query::<String>("token").filter(|t| !t.is_empty())
}

/// Client identity for rate limiting: first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then the socket peer address.
fn client_ip(req: &Request) -> String {
    if let Some(xff) = req.headers().get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if !xff.is_empty() {
            return xff.split(',').next().unwrap_or(xff).trim().to_string();
        }
    }

    if let Some(xri) = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !xri.is_empty() {
            return xri.to_string();
        }
    }

    let addr = req.remote_addr();
    if let Some(ipv4) = addr.as_ipv4() {
        return ipv4.ip().to_string();
    }
    if let Some(ipv6) = addr.as_ipv6() {
        return ipv6.ip().to_string();
    }
    addr.to_string()
}

/// Replace bare `\n`, `\r` and `\t` bytes inside JSON string literals with
/// their escape sequences. Purely lexical: a two-state machine tracking
/// in-string and escaped-next; bytes outside strings pass through.
fn repair_json(data: &[u8]) -> Cow<'_, [u8]> {
    if !data.iter().any(|b| matches!(b, b'\n' | b'\r' | b'\t')) {
        return Cow::Borrowed(data);
    }

    let mut out = Vec::with_capacity(data.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for &c in data {
        if escaped {
            out.push(c);
            escaped = false;
            continue;
        }
        if c == b'\\' && in_string {
            out.push(c);
            escaped = true;
            continue;
        }
        if c == b'"' {
            in_string = !in_string;
            out.push(c);
            continue;
        }
        if in_string {
            match c {
                b'\n' => out.extend_from_slice(b"\\n"),
                b'\r' => out.extend_from_slice(b"\\r"),
                b'\t' => out.extend_from_slice(b"\\t"),
                _ => out.push(c),
            }
        } else {
            out.push(c);
        }
    }

    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repair_identity_without_control_chars() {
        let body = br#"{"title":"t","content":"plain"}"#;
        let repaired = repair_json(body);
        assert!(matches!(repaired, Cow::Borrowed(_)));
        assert_eq!(repaired.as_ref(), body);
    }

    #[test]
    fn test_repair_newline_inside_string() {
        let body = b"{\"content\":\"line1\nline2\"}";
        let repaired = repair_json(body);
        assert_eq!(repaired.as_ref(), br#"{"content":"line1\nline2"}"#);

        let parsed: serde_json::Value = serde_json::from_slice(&repaired).expect("parse");
        assert_eq!(parsed["content"], "line1\nline2");
    }

    #[test]
    fn test_repair_all_control_chars() {
        let body = b"{\"content\":\"a\nb\rc\td\"}";
        let repaired = repair_json(body);
        assert_eq!(repaired.as_ref(), br#"{"content":"a\nb\rc\td"}"#);
    }

    #[test]
    fn test_repair_leaves_whitespace_outside_strings() {
        let body = b"{\n\t\"content\": \"x\"\r\n}";
        let repaired = repair_json(body);
        assert_eq!(repaired.as_ref(), body);
    }

    #[test]
    fn test_repair_preserves_existing_escapes() {
        // an escaped quote must not flip the in-string state
        let body = b"{\"content\":\"say \\\"hi\nthere\\\"\"}";
        let repaired = repair_json(body);
        let parsed: serde_json::Value = serde_json::from_slice(&repaired).expect("parse");
        assert_eq!(parsed["content"], "say \"hi\nthere\"");

        // already-escaped newlines stay as they are
        let body = br#"{"content":"a\nb"}"#;
        let repaired = repair_json(body);
        assert_eq!(repaired.as_ref(), body.as_slice());
    }

    #[test]
    fn test_repair_round_trip_push_message() {
        let msg = PushMessage {
            title: "t".into(),
            content: "line1\nline2".into(),
            extra: Some(json!({"k": 1})),
            timestamp: Utc::now(),
            client: "cli".into(),
        };
        let wire = serde_json::to_vec(&msg).expect("serialize");
        // serde escapes control characters, so repair must not touch it
        let repaired = repair_json(&wire);
        let back: PushMessage = serde_json::from_slice(&repaired).expect("parse");
        assert_eq!(back.title, msg.title);
        assert_eq!(back.content, msg.content);
        assert_eq!(back.extra, msg.extra);
    }

    #[test]
    fn test_extract_token_from_headers() {
        let mut req = Request::default();
        req.headers_mut().insert("authorization", "Bearer abc123".parse().expect("header"));
        assert_eq!(extract_token(&req).as_deref(), Some("abc123"));

        let mut req = Request::default();
        req.headers_mut().insert("authorization", "rawtoken".parse().expect("header"));
        assert_eq!(extract_token(&req).as_deref(), Some("rawtoken"));

        let mut req = Request::default();
        req.headers_mut().insert("x-auth-token", "xyz".parse().expect("header"));
        assert_eq!(extract_token(&req).as_deref(), Some("xyz"));

        let req = Request::default();
        assert_eq!(extract_token(&req), None);
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let mut req = Request::default();
        req.headers_mut()
            .insert("x-forwarded-for", "1.2.3.4, 10.0.0.1".parse().expect("header"));
        assert_eq!(client_ip(&req), "1.2.3.4");

        let mut req = Request::default();
        req.headers_mut().insert("x-real-ip", "5.6.7.8".parse().expect("header"));
        assert_eq!(client_ip(&req), "5.6.7.8");
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
        assert!(!constant_time_eq("", "abc"));
    }
}

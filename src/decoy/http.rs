//! HTTP decoy
//!
//! A small fake web application. Every request is classified and emitted as
//! an `http_request` event before it reaches a route; login forms capture
//! credentials and always fail.

use async_trait::async_trait;
use axum::extract::rejection::{FormRejection, QueryRejection};
use axum::extract::{DefaultBodyLimit, Extension, Form, Query, Request, State};
use axum::http::header::{self, HeaderValue};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tower::ServiceExt;
use tower_http::timeout::RequestBodyTimeoutLayer;
use tracing::{info, warn};

use crate::classify::{Classification, HttpClassifier};
use crate::config::HttpConfig;
use crate::decoy::{deny_login, tags_label, Decoy, Session};
use crate::error::{DecoyError, Result};
use crate::models::{AttackTag, DisconnectReason, EventKind, HttpRequestInfo, Service, ThreatLevel};
use crate::tracker::ActivityTracker;

struct HttpState {
    classifier: Arc<HttpClassifier>,
    tracker: Arc<ActivityTracker>,
    server_header: HeaderValue,
}

pub struct HttpDecoy {
    router: Router,
    idle_timeout: Duration,
}

impl HttpDecoy {
    pub fn new(
        config: &HttpConfig,
        classifier: Arc<HttpClassifier>,
        tracker: Arc<ActivityTracker>,
    ) -> Self {
        let state = Arc::new(HttpState {
            classifier,
            tracker,
            server_header: HeaderValue::from_str(&config.server_header)
                .unwrap_or_else(|_| HeaderValue::from_static("Apache")),
        });
        let idle_timeout = Duration::from_secs(config.idle_timeout_secs);
        Self {
            router: router(state, config.max_body_bytes, idle_timeout),
            idle_timeout,
        }
    }
}

#[async_trait]
impl Decoy for HttpDecoy {
    fn service(&self) -> Service {
        Service::Http
    }

    async fn handle(&self, stream: TcpStream, session: Session) -> Result<DisconnectReason> {
        let router = self.router.clone();
        let conn_session = session.clone();
        let service = service_fn(move |mut req: hyper::Request<Incoming>| {
            req.extensions_mut().insert(conn_session.clone());
            router.clone().oneshot(req)
        });

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.idle_timeout)
            .serve_connection(TokioIo::new(stream), service)
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DecoyError::Timeout(self.idle_timeout.as_secs())
                } else if e.is_parse() {
                    DecoyError::ProtocolViolation(e.to_string())
                } else {
                    DecoyError::Transport(std::io::Error::other(e))
                }
            })?;

        Ok(DisconnectReason::Closed)
    }
}

/// Headers are bounded by hyper's read timeout; the body timer restarts on
/// every frame, so a stalled upload fails its extractor instead of hanging.
fn router(state: Arc<HttpState>, max_body: usize, idle_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/robots.txt", get(robots))
        .route("/login", get(login_form).post(login_submit))
        .route("/admin", get(login_form).post(login_submit))
        .route("/wp-admin", get(login_form).post(login_submit))
        .route("/filemanager", get(file_manager))
        .route("/files", get(file_manager))
        .route("/phpmyadmin", get(database_login))
        .route("/database", get(database_login))
        .route("/phpmyadmin/login", post(database_submit))
        .route("/search", get(search))
        .route("/user", get(user_profile))
        .route("/api/users", get(api_users))
        .route("/api/config", get(api_config))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), observe))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(RequestBodyTimeoutLayer::new(idle_timeout))
        .with_state(state)
}

/// Classify and record every request before routing
async fn observe(
    State(state): State<Arc<HttpState>>,
    Extension(session): Extension<Session>,
    req: Request,
    next: Next,
) -> Response {
    let info = request_info(&req);
    let classification =
        state
            .classifier
            .classify(&info.method, &info.request_uri, &info.user_agent);

    state.tracker.record_http(&info.method, &info.user_agent);
    state.tracker.record_tags(&classification.tags);

    info!("HTTP request from {}: {} {}", session.ip(), info.method, info.request_uri);
    if !classification.is_empty() {
        warn!(
            "Detected attacks from {}: {} ({})",
            session.ip(),
            tags_label(&classification),
            classification.level
        );
    }
    session.emit_classified(EventKind::HttpRequest(info), &classification);

    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert(header::SERVER, state.server_header.clone());
    response
}

fn request_info(req: &Request) -> HttpRequestInfo {
    let header_str = |name: header::HeaderName| {
        req.headers()
            .get(name)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .unwrap_or_default()
    };

    let headers: BTreeMap<String, String> = req
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )
        })
        .collect();

    HttpRequestInfo {
        method: req.method().to_string(),
        request_uri: req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req.uri().path().to_string()),
        user_agent: header_str(header::USER_AGENT),
        referer: header_str(header::REFERER),
        content_type: header_str(header::CONTENT_TYPE),
        content_length: header_str(header::CONTENT_LENGTH).trim().parse().unwrap_or(0),
        query_string: req.uri().query().unwrap_or_default().to_string(),
        headers,
    }
}

fn form_field<'a>(form: &'a HashMap<String, String>, names: &[&str]) -> &'a str {
    names
        .iter()
        .find_map(|n| form.get(*n))
        .map(String::as_str)
        .unwrap_or("")
}

fn capture_login(
    state: &HttpState,
    session: &Session,
    form: std::result::Result<Form<HashMap<String, String>>, FormRejection>,
    user_fields: &[&str],
    pass_fields: &[&str],
) {
    let form = form.map(|Form(f)| f).unwrap_or_default();
    let username = form_field(&form, user_fields);
    let password = form_field(&form, pass_fields);
    let classification = Classification::single(AttackTag::CredentialStuffing, ThreatLevel::High);
    deny_login(session, &state.tracker, username, password, &classification);
}

async fn login_submit(
    State(state): State<Arc<HttpState>>,
    Extension(session): Extension<Session>,
    form: std::result::Result<Form<HashMap<String, String>>, FormRejection>,
) -> Html<&'static str> {
    capture_login(
        &state,
        &session,
        form,
        &["username", "user", "log", "email"],
        &["password", "pass", "pwd"],
    );
    Html(LOGIN_FAILED_PAGE)
}

async fn database_submit(
    State(state): State<Arc<HttpState>>,
    Extension(session): Extension<Session>,
    form: std::result::Result<Form<HashMap<String, String>>, FormRejection>,
) -> Html<&'static str> {
    capture_login(&state, &session, form, &["pma_username"], &["pma_password"]);
    Html(DATABASE_DENIED_PAGE)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

async fn robots() -> &'static str {
    "User-agent: *\nDisallow: /admin/\nDisallow: /config/\nDisallow: /backup/\nDisallow: /database/\n"
}

async fn login_form() -> Html<&'static str> {
    Html(LOGIN_PAGE)
}

async fn file_manager() -> Html<&'static str> {
    Html(FILE_MANAGER_PAGE)
}

async fn database_login() -> Html<&'static str> {
    Html(DATABASE_PAGE)
}

type Params = std::result::Result<Query<HashMap<String, String>>, QueryRejection>;

fn param(params: Params, name: &str) -> Option<String> {
    params.ok().and_then(|Query(mut p)| p.remove(name))
}

async fn search(params: Params) -> Html<String> {
    let query = param(params, "q").unwrap_or_default();
    Html(format!(
        "<html><body><h2>Search Results for: {}</h2><p>No results found.</p></body></html>",
        escape_html(&query)
    ))
}

async fn user_profile(params: Params) -> Html<String> {
    let id = param(params, "id").unwrap_or_else(|| "1".to_string());
    Html(format!(
        "<html><body><h2>User Profile</h2><p>User ID: {}</p></body></html>",
        escape_html(&id)
    ))
}

async fn api_users() -> Json<serde_json::Value> {
    Json(json!({
        "users": [
            {"id": 1, "username": "admin", "role": "administrator"},
            {"id": 2, "username": "user", "role": "user"}
        ]
    }))
}

async fn api_config() -> Json<serde_json::Value> {
    Json(json!({
        "database": {
            "host": "localhost",
            "username": "root",
            "password": "password123"
        },
        "api_key": "abc123def456"
    }))
}

async fn not_found(req: Request) -> Response {
    let path = escape_html(req.uri().path().trim_start_matches('/'));
    (
        StatusCode::NOT_FOUND,
        Html(format!(
            "<html><head><title>404 Not Found</title></head><body><h2>404 - Page Not Found</h2>\
             <p>The requested page \"{}\" was not found.</p><a href=\"/\">Home</a></body></html>",
            path
        )),
    )
        .into_response()
}

/// Escape text for inclusion in HTML element content or attributes
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            c => out.push(c),
        }
    }
    out
}

const INDEX_PAGE: &str = r#"<html>
<head><title>Welcome</title></head>
<body>
<h1>Welcome to Our Website</h1>
<p>This is a sample web application.</p>
<ul>
    <li><a href="/login">Admin Login</a></li>
    <li><a href="/filemanager">File Manager</a></li>
    <li><a href="/phpmyadmin">Database</a></li>
    <li><a href="/api/users">API Users</a></li>
</ul>
</body>
</html>"#;

const LOGIN_PAGE: &str = r#"<html>
<head><title>Admin Login</title></head>
<body>
<h2>Administrator Login</h2>
<form method="post">
    <p>Username: <input type="text" name="username" required></p>
    <p>Password: <input type="password" name="password" required></p>
    <p><input type="submit" value="Login"></p>
</form>
</body>
</html>"#;

const LOGIN_FAILED_PAGE: &str = r#"<html>
<head><title>Login Failed</title></head>
<body>
<h2>Login Failed</h2>
<p>Invalid credentials. Please try again.</p>
<a href="/login">Back to Login</a>
</body>
</html>"#;

const FILE_MANAGER_PAGE: &str = r#"<html>
<head><title>File Manager</title></head>
<body>
<h2>File Manager</h2>
<ul>
    <li><a href="/files/config.php">config.php</a></li>
    <li><a href="/files/database.sql">database.sql</a></li>
    <li><a href="/files/passwords.txt">passwords.txt</a></li>
    <li><a href="/files/backup.zip">backup.zip</a></li>
</ul>
</body>
</html>"#;

const DATABASE_PAGE: &str = r#"<html>
<head><title>phpMyAdmin</title></head>
<body>
<h2>phpMyAdmin 4.9.5</h2>
<p>MySQL Database Administration</p>
<form method="post" action="/phpmyadmin/login">
    <p>Username: <input type="text" name="pma_username"></p>
    <p>Password: <input type="password" name="pma_password"></p>
    <p><input type="submit" value="Go"></p>
</form>
</body>
</html>"#;

const DATABASE_DENIED_PAGE: &str = r#"<html>
<head><title>phpMyAdmin</title></head>
<body>
<h2>phpMyAdmin 4.9.5</h2>
<p>#1045 - Access denied for user</p>
<a href="/phpmyadmin">Back</a>
</body>
</html>"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoy::test_support::{drain, session};
    use crate::models::Event;
    use axum::body::Body;
    use tokio::sync::mpsc;

    fn decoy() -> HttpDecoy {
        HttpDecoy::new(
            &HttpConfig::default(),
            Arc::new(HttpClassifier::new().unwrap()),
            Arc::new(ActivityTracker::new()),
        )
    }

    async fn send(
        decoy: &HttpDecoy,
        req: axum::http::request::Builder,
        body: Body,
    ) -> (StatusCode, String, Vec<Event>) {
        let (session, mut rx): (Session, mpsc::Receiver<Event>) = session(Service::Http);
        let req = req.extension(session).body(body).unwrap();
        let resp = decoy.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        assert_eq!(resp.headers()[header::SERVER], "Apache/2.4.41 (Ubuntu)");
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned(), drain(&mut rx))
    }

    #[tokio::test]
    async fn test_every_request_is_classified() {
        let decoy = decoy();
        let (status, body, events) = send(
            &decoy,
            axum::http::Request::builder()
                .uri("/search?q=%27%20OR%201=1%20--")
                .header("user-agent", "sqlmap/1.7")
                .header("x-forwarded-for", "10.9.9.9"),
            Body::empty(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Search Results for: &#x27; OR 1=1 --"));
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.event_type(), "http_request");
        assert!(event.has_tag(AttackTag::SqlInjection));
        assert!(event.has_tag(AttackTag::AutomatedScan));
        assert_eq!(event.threat_level, Some(ThreatLevel::High));
        assert_eq!(event.source_ip.to_string(), "203.0.113.5");
        match &event.kind {
            EventKind::HttpRequest(info) => {
                assert_eq!(info.method, "GET");
                assert_eq!(info.query_string, "q=%27%20OR%201=1%20--");
                assert_eq!(info.headers["x-forwarded-for"], "10.9.9.9");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_login_post_captures_credentials() {
        let decoy = decoy();
        let (status, body, events) = send(
            &decoy,
            axum::http::Request::builder()
                .method("POST")
                .uri("/wp-admin")
                .header("content-type", "application/x-www-form-urlencoded"),
            Body::from("username=admin&password=letmein"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Login Failed"));
        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec!["http_request", "login_attempt"]);
        assert!(events[1].has_tag(AttackTag::CredentialStuffing));
        assert!(matches!(
            &events[1].kind,
            EventKind::LoginAttempt { username, password, success: false }
                if username == "admin" && password == "letmein"
        ));
    }

    #[tokio::test]
    async fn test_login_post_without_form_still_recorded() {
        let decoy = decoy();
        let (_, _, events) = send(
            &decoy,
            axum::http::Request::builder()
                .method("POST")
                .uri("/login")
                .header("content-type", "application/json"),
            Body::from("{}"),
        )
        .await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[1].kind,
            EventKind::LoginAttempt { username, password, .. } if username.is_empty() && password.is_empty()
        ));
    }

    #[tokio::test]
    async fn test_phpmyadmin_login() {
        let decoy = decoy();
        let (_, body, events) = send(
            &decoy,
            axum::http::Request::builder()
                .method("POST")
                .uri("/phpmyadmin/login")
                .header("content-type", "application/x-www-form-urlencoded"),
            Body::from("pma_username=root&pma_password="),
        )
        .await;
        assert!(body.contains("Access denied"));
        assert_eq!(events[1].event_type(), "login_attempt");
    }

    #[tokio::test]
    async fn test_fake_routes() {
        let decoy = decoy();
        let (status, body, _) = send(&decoy, axum::http::Request::builder().uri("/api/config"), Body::empty()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("password123"));

        let (_, body, _) = send(&decoy, axum::http::Request::builder().uri("/robots.txt"), Body::empty()).await;
        assert!(body.starts_with("User-agent: *"));

        let (status, body, events) = send(
            &decoy,
            axum::http::Request::builder().uri("/../../etc/passwd"),
            Body::empty(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("404 - Page Not Found"));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_reflected_input_is_escaped() {
        let decoy = decoy();
        let (_, body, events) = send(
            &decoy,
            axum::http::Request::builder().uri("/user?id=%3Cscript%3Ealert(1)%3C/script%3E"),
            Body::empty(),
        )
        .await;
        assert!(body.contains("&lt;script&gt;"));
        assert!(!body.contains("<script>"));
        assert!(events[0].has_tag(AttackTag::Xss));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(escape_html("<a href=\"x\">&'"), "&lt;a href=&quot;x&quot;&gt;&amp;&#x27;");
    }

    #[tokio::test]
    async fn test_stalled_body_ends_the_connection() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut config = HttpConfig::default();
        config.idle_timeout_secs = 1;
        let decoy = HttpDecoy::new(
            &config,
            Arc::new(HttpClassifier::new().unwrap()),
            Arc::new(ActivityTracker::new()),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        // promise 100 bytes, send 4, then go quiet without closing
        client
            .write_all(
                b"POST /login HTTP/1.1\r\nHost: victim\r\n\
                  Content-Type: application/x-www-form-urlencoded\r\n\
                  Content-Length: 100\r\n\r\nuser",
            )
            .await
            .unwrap();

        let (session, mut rx) = session(Service::Http);
        let handled = tokio::time::timeout(Duration::from_secs(5), decoy.handle(stream, session)).await;
        assert!(handled.is_ok(), "handler outlived the idle timeout");

        let mut reply = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        let reply = String::from_utf8_lossy(&reply);
        assert!(reply.starts_with("HTTP/1.1 200"));
        assert!(reply.contains("Login Failed"));

        let events = drain(&mut rx);
        assert_eq!(events[0].event_type(), "http_request");
    }
}

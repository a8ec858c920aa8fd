//! In-process fake of the OTP backend.
//!
//! Every request is recorded. Responses are canned per `METHOD /path`;
//! anything unregistered answers `404 {"detail": "Not Found"}` like the real
//! backend does.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use openpam_client::{ClientConfig, LoginOutcome, OtpClient};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use url::Url;

pub const ACCESS_TOKEN: &str = "access-token-alice";
pub const STRONG_PASSWORD: &str = "Sup3r$ecretPass";

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone)]
struct Canned {
    status: StatusCode,
    content_type: Option<&'static str>,
    body: String,
}

#[derive(Default)]
struct Shared {
    routes: Mutex<HashMap<String, Canned>>,
    requests: Mutex<Vec<Recorded>>,
}

pub struct FakeBackend {
    shared: Arc<Shared>,
    base_url: Url,
    server: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let shared = Arc::new(Shared::default());
        let app = Router::new().fallback(handle).with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            shared,
            base_url: format!("http://{addr}/").parse().unwrap(),
            server,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(self.base_url.clone())
    }

    pub fn client(&self) -> OtpClient {
        OtpClient::new(&self.config()).unwrap()
    }

    /// A client that has already logged in as alice.
    pub async fn logged_in_client(&self) -> OtpClient {
        self.respond_json("POST", "/token", 200, token_body(ACCESS_TOKEN));
        let client = self.client();
        let outcome = client.login("alice", STRONG_PASSWORD, None).await.unwrap();
        assert!(matches!(outcome, LoginOutcome::Authenticated(_)));
        client
    }

    pub fn respond_json(&self, method: &str, path: &str, status: u16, body: Value) {
        self.respond_raw(method, path, status, Some("application/json"), &body.to_string());
    }

    pub fn respond_raw(
        &self,
        method: &str,
        path: &str,
        status: u16,
        content_type: Option<&'static str>,
        body: &str,
    ) {
        self.shared.routes.lock().unwrap().insert(
            format!("{method} {path}"),
            Canned {
                status: StatusCode::from_u16(status).unwrap(),
                content_type,
                body: body.to_owned(),
            },
        );
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.shared.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, method: &str, path: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method.as_str() == method && r.path == path)
            .collect()
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn handle(
    State(shared): State<Arc<Shared>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let path = uri.path().to_owned();
    shared.requests.lock().unwrap().push(Recorded {
        method: method.clone(),
        path: path.clone(),
        query: uri.query().map(str::to_owned),
        authorization: headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
        body: serde_json::from_str(&body).ok(),
    });

    let canned = shared
        .routes
        .lock()
        .unwrap()
        .get(&format!("{method} {path}"))
        .cloned();

    match canned {
        Some(Canned {
            status,
            content_type: Some(content_type),
            body,
        }) => (status, [(header::CONTENT_TYPE, content_type)], body).into_response(),
        Some(Canned {
            status,
            content_type: None,
            body,
        }) => {
            let mut response = (status, body).into_response();
            response.headers_mut().remove(header::CONTENT_TYPE);
            response
        }
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            json!({"detail": "Not Found"}).to_string(),
        )
            .into_response(),
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────────────

pub fn token_body(access_token: &str) -> Value {
    json!({
        "access_token": access_token,
        "refresh_token": "refresh-token-alice",
        "token_type": "bearer",
        "mfa_required": false
    })
}

pub fn totp_config(id: i64) -> Value {
    json!({
        "id": id,
        "user_id": 1,
        "name": "VPN",
        "otp_type": "totp",
        "algorithm": "sha1",
        "digits": 6,
        "interval": 30,
        "counter": 0,
        "issuer": "Acme Corp",
        "is_active": true,
        "created_at": "2024-05-01T12:00:00.123456",
        "updated_at": "2024-05-01T12:00:00.123456"
    })
}

pub fn hotp_config(id: i64, counter: u64) -> Value {
    json!({
        "id": id,
        "user_id": 1,
        "name": "Door",
        "otp_type": "hotp",
        "algorithm": "sha1",
        "digits": 6,
        "interval": 30,
        "counter": counter,
        "issuer": "Acme Corp",
        "is_active": true,
        "created_at": "2024-05-01T12:00:00",
        "updated_at": null
    })
}

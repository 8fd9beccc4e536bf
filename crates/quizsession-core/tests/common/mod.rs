//! Shared fixtures for the session integration tests.
//!
//! Each test gets its own `wiremock` server standing in for the quiz service
//! and a session backed by an in-memory credential store.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use quizsession_core::{Config, MemoryCredentialStore, Session, TokenPair};
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn config(server: &MockServer) -> Config {
    Config::for_base_url(server.uri())
}

/// Fresh session with an empty store
pub fn session(server: &MockServer) -> (Session, Arc<MemoryCredentialStore>) {
    session_with_store(server, MemoryCredentialStore::new())
}

/// Session whose store already holds `access`/`refresh`, as after a restart
pub fn restored_session(
    server: &MockServer,
    access: &str,
    refresh: &str,
) -> (Session, Arc<MemoryCredentialStore>) {
    session_with_store(
        server,
        MemoryCredentialStore::with_tokens(TokenPair::new(access, refresh)),
    )
}

fn session_with_store(
    server: &MockServer,
    store: MemoryCredentialStore,
) -> (Session, Arc<MemoryCredentialStore>) {
    let store = Arc::new(store);
    let session = Session::new(&config(server), store.clone()).expect("Failed to build session");
    (session, store)
}

pub fn teacher_json() -> Value {
    json!({"id": 1, "name": "Ms. Frizzle", "email": "t@x.com", "role": "TEACHER"})
}

pub fn auth_json(token: &str, refresh: &str) -> Value {
    json!({"token": token, "refreshToken": refresh, "user": teacher_json()})
}

pub async fn mount_login(server: &MockServer, token: &str, refresh: &str) {
    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(auth_json(token, refresh)))
        .mount(server)
        .await;
}

/// Refresh endpoint that trades `refresh` for a new pair, after `delay`,
/// and must be called exactly `times` times
pub async fn mount_refresh(
    server: &MockServer,
    refresh: &str,
    new_token: &str,
    new_refresh: &str,
    delay: Duration,
    times: u64,
) {
    Mock::given(method("POST"))
        .and(path("/api/auth/refresh"))
        .and(body_json(json!({"token": refresh})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"token": new_token, "refreshToken": new_refresh}))
                .set_delay(delay),
        )
        .expect(times)
        .mount(server)
        .await;
}

/// GET `route` answers `status` with `body` when called with `token`
pub async fn mount_get(server: &MockServer, route: &str, token: &str, status: u16, body: Value) {
    Mock::given(method("GET"))
        .and(path(route))
        .and(header("authorization", format!("Bearer {}", token).as_str()))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(server)
        .await;
}

pub fn quizzes_json() -> Value {
    json!([{"id": 1, "title": "Fractions", "difficulty": "EASY"}])
}

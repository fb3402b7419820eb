//! End-to-end tests for the HTTP surface: a real server on 127.0.0.1:0 driven by reqwest.

use anyhow::Result;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tokio::sync::oneshot;

use kvgate::config::ServerConfig;
use kvgate::identity::Principal;
use kvgate::server::{serve, AppState};

struct TestServer {
    base: String,
    state: AppState,
    client: reqwest::Client,
    _stop: oneshot::Sender<()>,
    _dir: TempDir,
}

impl TestServer {
    async fn start(tweak: impl FnOnce(&mut ServerConfig)) -> Result<Self> {
        let dir = tempdir()?;
        let mut config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            persist_interval_ms: 0,
            clear_all_key: Some("letmein".into()),
            ..ServerConfig::default()
        };
        tweak(&mut config);
        let state = AppState::open(config)?;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        let (tx, rx) = oneshot::channel::<()>();
        let st = state.clone();
        tokio::spawn(async move {
            let _ = serve(listener, st, async { let _ = rx.await; }).await;
        });
        Ok(Self { base, state, client: reqwest::Client::new(), _stop: tx, _dir: dir })
    }

    fn token(&self, user: &str, rules: Value) -> String {
        let raw = rules.as_array().cloned().unwrap_or_default();
        self.state.sessions.issue(Principal::from_raw_rules(user, &raw)).expect("session token").token
    }

    fn admin(&self) -> String { self.token("admin", json!([[null, null, null, ["get", "set", "remove"]]])) }

    async fn post(&self, path: &str, token: Option<&str>, body: Value) -> Result<(u16, Value)> {
        let mut req = self.client.post(format!("{}{}", self.base, path)).json(&body);
        if let Some(t) = token { req = req.bearer_auth(t); }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        Ok((status, resp.json::<Value>().await?))
    }
}

fn quiz(value: Value) -> Value {
    json!({"namespace": "quiz-app", "collection": "quizzes", "collectionKey": "q1", "fieldKey": "data", "value": value})
}

#[tokio::test]
async fn set_get_remove_round_trip() -> Result<()> {
    let srv = TestServer::start(|_| {}).await?;
    let admin = srv.admin();

    let (status, body) = srv.post("/setItem", Some(&admin), quiz(json!({"a": 1}))).await?;
    assert_eq!(status, 200);
    assert_eq!(body["affectedCount"], 1);

    let (_, body) = srv.post("/setItem", Some(&admin), quiz(json!({"a": 1}))).await?;
    assert_eq!(body["affectedCount"], 0, "identical write is not counted");

    let (status, body) = srv.post("/getItem", Some(&admin), json!({
        "namespace": "quiz-app", "collection": "quizzes", "collectionKey": "q1", "fieldKey": "data"
    })).await?;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"quiz-app": {"quizzes": {"collectionKey": "q1", "data": {"a": 1}}}}));

    let (status, body) = srv.post("/removeItem", Some(&admin), json!({"namespace": "quiz-app", "collection": "quizzes"})).await?;
    assert_eq!(status, 200);
    assert_eq!(body["deletedCount"], 1);

    let (_, body) = srv.post("/removeItem", Some(&admin), json!({"namespace": "quiz-app", "collection": "quizzes"})).await?;
    assert_eq!(body["deletedCount"], 0);
    Ok(())
}

#[tokio::test]
async fn legacy_field_names_are_accepted() -> Result<()> {
    let srv = TestServer::start(|_| {}).await?;
    let admin = srv.admin();
    let (status, _) = srv.post("/setItem", Some(&admin), json!({
        "app": "legacy", "collectionName": "c", "collectionKey": "k", "key": "f", "value": true
    })).await?;
    assert_eq!(status, 200);
    let (_, body) = srv.post("/getItem", Some(&admin), json!({"namespace": "legacy"})).await?;
    assert_eq!(body, json!({"legacy": {"c": {"collectionKey": "k", "f": true}}}));
    Ok(())
}

#[tokio::test]
async fn missing_and_invalid_tokens_are_rejected() -> Result<()> {
    let srv = TestServer::start(|_| {}).await?;
    let (status, body) = srv.post("/getItem", None, json!({})).await?;
    assert_eq!(status, 401);
    assert_eq!(body["message"], "No token provided");

    let (status, body) = srv.post("/setItem", Some("bogus"), quiz(json!(1))).await?;
    assert_eq!(status, 401);
    assert_eq!(body["message"], "Invalid or expired token");
    assert!(srv.state.store.is_empty());
    Ok(())
}

#[tokio::test]
async fn denial_lists_every_refused_address() -> Result<()> {
    let srv = TestServer::start(|_| {}).await?;
    let reader = srv.token("reader", json!([{"namespace": "quiz-app", "collection": "quizzes", "key": null, "methods": ["get"]}]));
    let (status, body) = srv.post("/setItem", Some(&reader), json!({
        "namespace": "quiz-app", "collection": "quizzes", "collectionKey": "q1",
        "fieldKey": ["a", "b"], "value": [1, 2]
    })).await?;
    assert_eq!(status, 403);
    assert_eq!(body["status"], "error");
    assert_eq!(body["denied"], json!([
        {"namespace": "quiz-app", "collection": "quizzes", "collectionKey": "q1", "fieldKey": "a"},
        {"namespace": "quiz-app", "collection": "quizzes", "collectionKey": "q1", "fieldKey": "b"}
    ]));
    assert!(srv.state.store.is_empty());
    Ok(())
}

#[tokio::test]
async fn validation_errors_are_400() -> Result<()> {
    let srv = TestServer::start(|_| {}).await?;
    let admin = srv.admin();
    let (status, body) = srv.post("/setItem", Some(&admin), json!({
        "namespace": "a", "collection": ["x", "y"], "collectionKey": "k", "fieldKey": ["1", "2", "3"], "value": 1
    })).await?;
    assert_eq!(status, 400);
    assert_eq!(body["code"], "inconsistent_lengths");

    let (status, _) = srv.post("/removeItem", Some(&admin), json!({})).await?;
    assert_eq!(status, 400);

    let (status, body) = srv.post("/getItem", Some(&admin), json!([1, 2])).await?;
    assert_eq!(status, 400);
    assert_eq!(body["status"], "error");
    Ok(())
}

#[tokio::test]
async fn rate_limit_applies_per_client() -> Result<()> {
    let srv = TestServer::start(|c| c.rate_limit = 3).await?;
    let admin = srv.admin();
    for _ in 0..3 {
        let (status, _) = srv.post("/getItem", Some(&admin), json!({"namespace": "x"})).await?;
        assert_eq!(status, 200);
    }
    let (status, body) = srv.post("/getItem", Some(&admin), json!({"namespace": "x"})).await?;
    assert_eq!(status, 429);
    assert_eq!(body["message"], "Too many requests, please try again later.");

    let resp = srv.client.get(format!("{}/", srv.base)).send().await?;
    assert_eq!(resp.status().as_u16(), 200, "liveness is not rate limited");
    Ok(())
}

#[tokio::test]
async fn clear_all_requires_secret_and_wipes_everything() -> Result<()> {
    let srv = TestServer::start(|_| {}).await?;
    let admin = srv.admin();
    srv.post("/setItem", Some(&admin), quiz(json!(1))).await?;

    let (status, _) = srv.post("/clearAll", None, json!({"password": "wrong"})).await?;
    assert_eq!(status, 401);
    assert_eq!(srv.state.store.len(), 1);

    let (status, body) = srv.post("/clearAll", None, json!({"password": "letmein"})).await?;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["deletedItems"], 1);
    assert!(srv.state.store.is_empty());
    assert!(srv.state.store.dir().map(|d| d.join("items.snapshot").exists()).unwrap_or(false));

    let (status, _) = srv.post("/getItem", Some(&admin), json!({})).await?;
    assert_eq!(status, 401, "sessions are revoked by a bulk clear");
    Ok(())
}

#[tokio::test]
async fn clear_all_disabled_without_configured_secret() -> Result<()> {
    let srv = TestServer::start(|c| c.clear_all_key = None).await?;
    let (status, _) = srv.post("/clearAll", None, json!({"password": ""})).await?;
    assert_eq!(status, 401);
    Ok(())
}

#[tokio::test]
async fn seeded_identity_tokens_authenticate() -> Result<()> {
    let seed_dir = tempdir()?;
    let seed = seed_dir.path().join("ids.json");
    std::fs::write(&seed, serde_json::to_vec(&json!([
        {"userId": "quizzer", "token": "t-quiz", "rules": [["quiz-app", null, null, ["get", "set"]]]}
    ]))?)?;
    let seed_path = seed.clone();
    let srv = TestServer::start(move |c| c.identities_file = Some(seed_path)).await?;

    let (status, _) = srv.post("/setItem", Some("t-quiz"), quiz(json!("hello"))).await?;
    assert_eq!(status, 200);
    let (status, body) = srv.post("/removeItem", Some("t-quiz"), json!({"namespace": "quiz-app"})).await?;
    assert_eq!(status, 403);
    assert_eq!(body["denied"][0]["namespace"], "quiz-app");
    Ok(())
}

#[tokio::test]
async fn unknown_routes_return_json_404() -> Result<()> {
    let srv = TestServer::start(|_| {}).await?;
    let resp = srv.client.get(format!("{}/nope", srv.base)).send().await?;
    assert_eq!(resp.status().as_u16(), 404);
    let body: Value = resp.json().await?;
    assert_eq!(body["code"], "not_found");
    assert!(resp_has_request_id(&srv).await?);
    Ok(())
}

async fn resp_has_request_id(srv: &TestServer) -> Result<bool> {
    let resp = srv.client.get(format!("{}/", srv.base)).send().await?;
    Ok(resp.headers().contains_key("x-request-id"))
}

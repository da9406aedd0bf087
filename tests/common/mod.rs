//! Shared fixtures for integration tests
//!
//! - `FakeDataPlane`: an in-process HAProxy Data Plane API with versioned
//!   transactions, served over hyper
//! - `FakeEngine`: a scripted build engine
//! - `FakeRuntime`: a destination runtime that records its calls

#![allow(dead_code)]

use async_trait::async_trait;
use berth::builder::{BuildEngine, BuildEvent, BuildRequest};
use berth::config::{Config, ProxyConfig};
use berth::deploy::DestinationRuntime;
use berth::error::{DeployError, Result};
use berth::model::Destination;
use futures::stream::BoxStream;
use futures::StreamExt;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;

const CONFIG_PREFIX: &str = "/v2/services/haproxy/configuration/";
const TX_PREFIX: &str = "/v2/services/haproxy/transactions";

fn json_response(status: StatusCode, body: Value) -> Response<Full<Bytes>> {
    let bytes = if body.is_null() {
        Bytes::new()
    } else {
        Bytes::from(body.to_string())
    };
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(bytes))
        .unwrap()
}

fn not_found(what: &str) -> Response<Full<Bytes>> {
    json_response(
        StatusCode::NOT_FOUND,
        json!({"code": 404, "message": format!("{} not found", what)}),
    )
}

// ==================== Proxy configuration model ====================

/// One snapshot of the proxy configuration
#[derive(Debug, Clone, Default)]
pub struct ProxyState {
    pub backends: BTreeMap<String, Value>,
    /// keyed by (backend, server)
    pub servers: BTreeMap<(String, String), Value>,
    pub frontends: BTreeMap<String, Value>,
    /// keyed by (frontend, bind)
    pub binds: BTreeMap<(String, String), Value>,
    /// ordered by index, keyed by parent frontend
    pub http_rules: BTreeMap<String, Vec<Value>>,
    pub tcp_rules: BTreeMap<String, Vec<Value>>,
}

impl ProxyState {
    fn insert_rule(rules: &mut Vec<Value>, mut rule: Value) {
        let index = rule
            .get("index")
            .and_then(Value::as_u64)
            .unwrap_or(rules.len() as u64) as usize;
        let index = index.min(rules.len());
        rule["index"] = json!(index);
        rules.insert(index, rule);
        Self::reindex(rules);
    }

    fn reindex(rules: &mut [Value]) {
        for (i, rule) in rules.iter_mut().enumerate() {
            rule["index"] = json!(i);
        }
    }

    fn remove_frontend(&mut self, name: &str) {
        self.frontends.remove(name);
        self.binds.retain(|(frontend, _), _| frontend != name);
        self.http_rules.remove(name);
        self.tcp_rules.remove(name);
    }

    fn remove_backend(&mut self, name: &str) {
        self.backends.remove(name);
        self.servers.retain(|(backend, _), _| backend != name);
    }
}

/// Recorded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recorded {
    pub method: String,
    pub path: String,
}

#[derive(Debug, Default)]
struct DataPlaneInner {
    committed: ProxyState,
    version: u64,
    transactions: HashMap<String, (u64, ProxyState)>,
    next_tx: u64,
    requests: Vec<Recorded>,
    /// (method, path fragment) answered with a 500 once
    fail_once: Option<(String, String)>,
    reject_commits: bool,
}

/// Handle to a running fake Data Plane API
#[derive(Clone)]
pub struct FakeDataPlane {
    pub url: String,
    inner: Arc<Mutex<DataPlaneInner>>,
}

impl FakeDataPlane {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let inner = Arc::new(Mutex::new(DataPlaneInner {
            version: 1,
            ..Default::default()
        }));

        let shared = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = Arc::clone(&shared);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, hyper::Error>(handle(req, state).await) }
                    });
                    let _ = AutoBuilder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        Self {
            url: format!("http://{}", addr),
            inner,
        }
    }

    pub fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            api_url: self.url.clone(),
            ..ProxyConfig::default()
        }
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    pub fn committed(&self) -> ProxyState {
        self.inner.lock().committed.clone()
    }

    pub fn open_transactions(&self) -> usize {
        self.inner.lock().transactions.len()
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.inner.lock().requests.clone()
    }

    /// Requests other than GET, i.e. transactions and mutations
    pub fn mutating_requests(&self) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method != "GET")
            .collect()
    }

    pub fn clear_requests(&self) {
        self.inner.lock().requests.clear();
    }

    /// Answer the next `method` request whose path contains `fragment` with a 500
    pub fn fail_once(&self, method: &str, fragment: &str) {
        self.inner.lock().fail_once = Some((method.to_string(), fragment.to_string()));
    }

    /// Make every commit fail as if the base version were stale
    pub fn reject_commits(&self) {
        self.inner.lock().reject_commits = true;
    }

    /// Simulate another client committing a change
    pub fn bump_version(&self) {
        self.inner.lock().version += 1;
    }

    /// Seed committed configuration directly
    pub fn seed(&self, f: impl FnOnce(&mut ProxyState)) {
        let mut inner = self.inner.lock();
        f(&mut inner.committed);
        inner.version += 1;
    }
}

/// URL nothing listens on
pub async fn unreachable_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .unwrap_or_default()
        .split('&')
        .filter(|p| !p.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.replace("%2F", "/").replace("%20", " ")))
        .collect()
}

async fn handle(req: Request<Incoming>, state: Arc<Mutex<DataPlaneInner>>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query());

    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Basic "));

    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .unwrap_or_default();
    let body: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };

    let mut inner = state.lock();
    inner.requests.push(Recorded {
        method: method.to_string(),
        path: path.clone(),
    });

    if !authorized {
        return json_response(StatusCode::UNAUTHORIZED, json!({"message": "unauthorized"}));
    }

    if let Some((fail_method, fragment)) = inner.fail_once.clone() {
        if fail_method == method.as_str() && path.contains(&fragment) {
            inner.fail_once = None;
            return json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"code": 500, "message": "injected failure"}),
            );
        }
    }

    match (&method, path.as_str()) {
        (&Method::GET, "/v2/info") => {
            json_response(StatusCode::OK, json!({"api": {"version": "v2"}}))
        }
        (&Method::GET, "/v2/services/haproxy/configuration/raw") => json_response(
            StatusCode::OK,
            json!({"_version": inner.version, "data": "global\n"}),
        ),
        (&Method::GET, "/v2/services/haproxy/reloads") => json_response(
            StatusCode::OK,
            json!([{"id": "1", "status": "succeeded", "response": ""}]),
        ),
        _ if path.starts_with(TX_PREFIX) => handle_transaction(&mut inner, &method, &path, &query),
        _ if path.starts_with(CONFIG_PREFIX) => {
            handle_configuration(&mut inner, &method, &path, &query, body)
        }
        _ => not_found(&path),
    }
}

fn handle_transaction(
    inner: &mut DataPlaneInner,
    method: &Method,
    path: &str,
    query: &HashMap<String, String>,
) -> Response<Full<Bytes>> {
    let id = path
        .trim_start_matches(TX_PREFIX)
        .trim_start_matches('/')
        .to_string();

    match *method {
        Method::POST if id.is_empty() => {
            let version: u64 = query
                .get("version")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            if version != inner.version {
                return json_response(
                    StatusCode::CONFLICT,
                    json!({"code": 409, "message": "version mismatch"}),
                );
            }
            inner.next_tx += 1;
            let id = format!("tx-{}", inner.next_tx);
            let staged = inner.committed.clone();
            inner.transactions.insert(id.clone(), (version, staged));
            json_response(
                StatusCode::CREATED,
                json!({"id": id, "_version": version, "status": "in_progress"}),
            )
        }
        Method::PUT => {
            let Some((base, staged)) = inner.transactions.remove(&id) else {
                return not_found(&id);
            };
            if inner.reject_commits || base != inner.version {
                return json_response(
                    StatusCode::NOT_ACCEPTABLE,
                    json!({"code": 406, "message": "transaction is outdated"}),
                );
            }
            inner.committed = staged;
            inner.version += 1;
            json_response(StatusCode::ACCEPTED, json!({"id": id, "status": "success"}))
        }
        Method::DELETE => match inner.transactions.remove(&id) {
            Some(_) => json_response(StatusCode::NO_CONTENT, Value::Null),
            None => not_found(&id),
        },
        _ => json_response(StatusCode::METHOD_NOT_ALLOWED, Value::Null),
    }
}

fn handle_configuration(
    inner: &mut DataPlaneInner,
    method: &Method,
    path: &str,
    query: &HashMap<String, String>,
    body: Value,
) -> Response<Full<Bytes>> {
    let rest = path.trim_start_matches(CONFIG_PREFIX);
    let (kind, name) = match rest.split_once('/') {
        Some((kind, name)) => (kind, Some(name.to_string())),
        None => (rest, None),
    };
    let version = inner.version;

    if *method == Method::GET {
        let config = match query.get("transaction_id") {
            Some(tx) => match inner.transactions.get(tx) {
                Some((_, staged)) => staged,
                None => return not_found(tx),
            },
            None => &inner.committed,
        };
        let data = read(config, kind, name.as_deref(), query);
        return match data {
            Some(data) => json_response(StatusCode::OK, json!({"_version": version, "data": data})),
            None => not_found(rest),
        };
    }

    let Some(tx) = query.get("transaction_id") else {
        return json_response(
            StatusCode::BAD_REQUEST,
            json!({"code": 400, "message": "transaction_id required"}),
        );
    };
    let Some((_, staged)) = inner.transactions.get_mut(tx) else {
        return not_found(tx);
    };

    match write(staged, method, kind, name.as_deref(), query, body) {
        Ok(status) => json_response(status, json!({})),
        Err(status) => json_response(status, json!({"code": status.as_u16(), "message": rest})),
    }
}

fn param(query: &HashMap<String, String>, key: &str) -> String {
    query.get(key).cloned().unwrap_or_default()
}

fn read(
    config: &ProxyState,
    kind: &str,
    name: Option<&str>,
    query: &HashMap<String, String>,
) -> Option<Value> {
    match (kind, name) {
        ("backends", Some(name)) => config.backends.get(name).cloned(),
        ("frontends", Some(name)) => config.frontends.get(name).cloned(),
        ("servers", Some(name)) => config
            .servers
            .get(&(param(query, "backend"), name.to_string()))
            .cloned(),
        ("binds", Some(name)) => config
            .binds
            .get(&(param(query, "frontend"), name.to_string()))
            .cloned(),
        ("http_request_rules", None) => Some(Value::Array(
            config
                .http_rules
                .get(&param(query, "parent_name"))
                .cloned()
                .unwrap_or_default(),
        )),
        ("tcp_request_rules", None) => Some(Value::Array(
            config
                .tcp_rules
                .get(&param(query, "parent_name"))
                .cloned()
                .unwrap_or_default(),
        )),
        _ => None,
    }
}

fn write(
    config: &mut ProxyState,
    method: &Method,
    kind: &str,
    name: Option<&str>,
    query: &HashMap<String, String>,
    body: Value,
) -> std::result::Result<StatusCode, StatusCode> {
    let body_name = body
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match (method, kind, name) {
        (&Method::POST, "backends", None) => {
            if config.backends.contains_key(&body_name) {
                return Err(StatusCode::CONFLICT);
            }
            config.backends.insert(body_name, body);
        }
        (&Method::DELETE, "backends", Some(name)) => {
            if !config.backends.contains_key(name) {
                return Err(StatusCode::NOT_FOUND);
            }
            config.remove_backend(name);
        }
        (&Method::POST, "servers", None) => {
            let backend = param(query, "backend");
            if !config.backends.contains_key(&backend) {
                return Err(StatusCode::BAD_REQUEST);
            }
            config.servers.insert((backend, body_name), body);
        }
        (&Method::POST, "frontends", None) => {
            if config.frontends.contains_key(&body_name) {
                return Err(StatusCode::CONFLICT);
            }
            config.frontends.insert(body_name, body);
        }
        (&Method::DELETE, "frontends", Some(name)) => {
            if !config.frontends.contains_key(name) {
                return Err(StatusCode::NOT_FOUND);
            }
            config.remove_frontend(name);
        }
        (&Method::POST, "binds", None) => {
            let frontend = param(query, "frontend");
            if !config.frontends.contains_key(&frontend) {
                return Err(StatusCode::BAD_REQUEST);
            }
            config.binds.insert((frontend, body_name), body);
        }
        (&Method::POST, "http_request_rules", None) => {
            let rules = config
                .http_rules
                .entry(param(query, "parent_name"))
                .or_default();
            ProxyState::insert_rule(rules, body);
        }
        (&Method::POST, "tcp_request_rules", None) => {
            let rules = config
                .tcp_rules
                .entry(param(query, "parent_name"))
                .or_default();
            ProxyState::insert_rule(rules, body);
        }
        (&Method::DELETE, "http_request_rules", Some(index))
        | (&Method::DELETE, "tcp_request_rules", Some(index)) => {
            let rules = if kind == "http_request_rules" {
                config.http_rules.get_mut(&param(query, "parent_name"))
            } else {
                config.tcp_rules.get_mut(&param(query, "parent_name"))
            };
            let Some(rules) = rules else {
                return Err(StatusCode::NOT_FOUND);
            };
            let index: usize = index.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
            if index >= rules.len() {
                return Err(StatusCode::NOT_FOUND);
            }
            rules.remove(index);
            ProxyState::reindex(rules);
            return Ok(StatusCode::NO_CONTENT);
        }
        _ => return Err(StatusCode::METHOD_NOT_ALLOWED),
    }
    Ok(if *method == Method::DELETE {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::CREATED
    })
}

// ==================== Build engine and runtime ====================

/// Build engine answering every build with the same scripted events
pub struct FakeEngine {
    events: Vec<BuildEvent>,
    pub requests: Mutex<Vec<BuildRequest>>,
}

impl FakeEngine {
    pub fn succeeding() -> Arc<Self> {
        Self::scripted(vec![
            BuildEvent::stream("Step 1/1 : FROM scratch\n"),
            BuildEvent::stream("Successfully built\n"),
        ])
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Self::scripted(vec![
            BuildEvent::stream("Step 1/1 : FROM scratch\n"),
            BuildEvent::error(message),
        ])
    }

    pub fn scripted(events: Vec<BuildEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn tags(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.tag.clone()).collect()
    }
}

#[async_trait]
impl BuildEngine for FakeEngine {
    async fn build_image(
        &self,
        request: BuildRequest,
    ) -> Result<BoxStream<'static, Result<BuildEvent>>> {
        self.requests.lock().push(request);
        let events: Vec<Result<BuildEvent>> = self.events.iter().cloned().map(Ok).collect();
        Ok(futures::stream::iter(events).boxed())
    }
}

/// Destination runtime recording calls instead of running docker
#[derive(Default)]
pub struct FakeRuntime {
    pub calls: Mutex<Vec<String>>,
    pub proxy_running: Mutex<bool>,
    pub fail_volume: bool,
    pub fail_compose: bool,
    pub fail_network: bool,
}

impl FakeRuntime {
    pub fn running_proxy() -> Self {
        Self {
            proxy_running: Mutex::new(true),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl DestinationRuntime for FakeRuntime {
    async fn create_volume(&self, destination: &Destination, name: &str) -> Result<()> {
        self.calls
            .lock()
            .push(format!("volume {} {}", destination.id, name));
        if self.fail_volume {
            return Err(DeployError::ComposeApply("volume exists".into()));
        }
        Ok(())
    }

    async fn compose_up(&self, destination: &Destination, compose_file: &Path) -> Result<()> {
        self.calls
            .lock()
            .push(format!("compose {} {}", destination.id, compose_file.display()));
        if self.fail_compose {
            return Err(DeployError::ComposeApply("no such image".into()));
        }
        Ok(())
    }

    async fn proxy_running(&self, _destination: &Destination) -> Result<bool> {
        Ok(*self.proxy_running.lock())
    }

    async fn start_proxy(&self, destination: &Destination) -> Result<()> {
        self.calls.lock().push(format!("start-proxy {}", destination.id));
        *self.proxy_running.lock() = true;
        Ok(())
    }

    async fn connect_network(&self, _destination: &Destination, network: &str) -> Result<()> {
        self.calls.lock().push(format!("connect {}", network));
        if self.fail_network {
            return Err(DeployError::Runtime("network not found".into()));
        }
        Ok(())
    }
}

// ==================== Configuration ====================

/// Config with a local destination and the proxy API at `api_url`
pub fn test_config(api_url: &str, build_root: &Path) -> Config {
    let toml = format!(
        r#"
[proxy]
api_url = "{}"
request_timeout_secs = 5

[workspace]
build_root = "{}"

[destinations.local]
engine = "unix:///var/run/docker.sock"
network = "berth"
subnet = "10.0.0.0/24"

[destinations.edge]
engine = "tcp://10.1.0.5:2375"
network = "edge-net"
swarm = true
"#,
        api_url,
        build_root.display()
    );
    Config::parse(&toml).unwrap()
}

pub fn source_dir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<h1>hello</h1>").unwrap();
    std::fs::write(dir.path().join("package.json"), "{}").unwrap();
    let path = dir.path().to_path_buf();
    (dir, path)
}

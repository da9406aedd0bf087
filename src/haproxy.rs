//! HAProxy Data Plane API client
//!
//! Every configuration change goes through a versioned transaction:
//!
//! ```text
//! begin(version) -> mutations (transaction_id=...) -> commit | discard
//! ```
//!
//! A [`Transaction`] is an explicit value threaded through each mutation, and
//! every configuration operation hands its outcome to [`ProxyClient::finish`],
//! which always issues the terminal call. Commits against a stale version are
//! rejected by the server and surface as [`DeployError::TransactionConflict`].
//!
//! Routing operations check `GET /v2/info` first. Additive operations skip
//! routing when the proxy is down; removals and visibility changes fail.

use crate::config::{FailurePolicy, ProxyConfig};
use crate::error::{DeployError, Result};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

const CONFIGURATION: &str = "/services/haproxy/configuration";
const TRANSACTIONS: &str = "/services/haproxy/transactions";
const INIT_ADDR: &str = "last,libc,none";

/// What a routing operation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingOutcome {
    /// A transaction was committed
    Applied,
    /// The proxy already matched; no transaction was opened
    Unchanged,
    /// The proxy was unreachable and routing was not attempted
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Began,
    Mutated,
    Committed,
    Discarded,
    Conflicted,
}

/// A mutation already sent within a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOp {
    pub method: String,
    pub path: String,
}

/// An open configuration transaction on the proxy
#[derive(Debug)]
pub struct Transaction {
    pub id: String,
    /// Configuration version the transaction is based on
    pub version: u64,
    state: TransactionState,
    ops: Vec<PendingOp>,
}

impl Transaction {
    fn new(id: String, version: u64) -> Self {
        Self {
            id,
            version,
            state: TransactionState::Began,
            ops: Vec::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn ops(&self) -> &[PendingOp] {
        &self.ops
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            TransactionState::Began | TransactionState::Mutated
        )
    }

    fn record(&mut self, method: &Method, path: &str) {
        self.ops.push(PendingOp {
            method: method.to_string(),
            path: path.to_string(),
        });
        self.state = TransactionState::Mutated;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_open() {
            warn!(
                transaction = %self.id,
                version = self.version,
                ops = self.ops.len(),
                "Proxy transaction dropped while still open"
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forwardfor {
    pub enabled: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(rename = "init-addr", default, skip_serializing_if = "Option::is_none")]
    pub init_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwardfor: Option<Forwardfor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    pub address: String,
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frontend {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_backend: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    pub name: String,
    pub address: String,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequestRule {
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond_test: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redir_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redir_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redir_code: Option<u16>,
}

impl HttpRequestRule {
    /// Redirect plain HTTP requests for `domain` to HTTPS
    pub fn ssl_redirect(domain: &str, index: u32) -> Self {
        Self {
            index,
            kind: "redirect".to_string(),
            cond: Some("if".to_string()),
            cond_test: Some(format!("{{ hdr(Host) -i {} }} !{{ ssl_fc }}", domain)),
            redir_type: Some("scheme".to_string()),
            redir_value: Some("https".to_string()),
            redir_code: Some(301),
        }
    }

    pub fn matches_domain(&self, domain: &str) -> bool {
        let needle = format!("-i {}", domain);
        self.cond_test
            .as_deref()
            .map(|test| {
                test.match_indices(&needle).any(|(at, _)| {
                    // stop "a.com" from matching "a.com.evil"
                    test[at + needle.len()..]
                        .chars()
                        .next()
                        .map_or(true, |c| c.is_whitespace() || c == '}')
                })
            })
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpRequestRule {
    pub index: u32,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond_test: Option<String>,
}

impl TcpRequestRule {
    /// Accept connections from `subnet` only
    pub fn accept_subnet(subnet: &str) -> Self {
        Self {
            index: 0,
            kind: "connection".to_string(),
            action: Some("accept".to_string()),
            cond: Some("if".to_string()),
            cond_test: Some(format!("{{ src {} }}", subnet)),
        }
    }
}

/// One entry of `GET /services/haproxy/reloads`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Reload {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub response: Option<String>,
}

/// Next free index after the existing rules
fn next_rule_index(indexes: impl Iterator<Item = u32>) -> u32 {
    indexes.max().map_or(0, |last| last + 1)
}

/// Client for the proxy's Data Plane API
#[derive(Debug, Clone)]
pub struct ProxyClient {
    http: reqwest::Client,
    base_url: String,
    user: String,
    password: String,
    http_frontend: String,
    failure_policy: FailurePolicy,
}

impl ProxyClient {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self::with_client(http, config))
    }

    /// Use an already configured HTTP client
    pub fn with_client(http: reqwest::Client, config: &ProxyConfig) -> Self {
        Self {
            http,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
            http_frontend: config.http_frontend.clone(),
            failure_policy: config.failure_policy,
        }
    }

    // ==================== HTTP plumbing ====================

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{}/v2{}", self.base_url, path);
        let mut request = self
            .http
            .request(method.clone(), &url)
            .basic_auth(&self.user, Some(&self.password))
            .query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(DeployError::ProxyApi {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        if text.trim().is_empty() {
            Ok(Value::Null)
        } else {
            Ok(serde_json::from_str(&text)?)
        }
    }

    /// GET returning the `data` member, `None` on 404
    async fn get_data<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>> {
        match self.request(Method::GET, path, query, None).await {
            Ok(mut value) => {
                let data = value.get_mut("data").map(Value::take).unwrap_or(value);
                Ok(Some(serde_json::from_value(data)?))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn mutate<B: Serialize>(
        &self,
        tx: &mut Transaction,
        method: Method,
        path: &str,
        mut query: Vec<(&str, String)>,
        body: Option<&B>,
    ) -> Result<()> {
        if !tx.is_open() {
            return Err(DeployError::Configuration(format!(
                "transaction {} is no longer open",
                tx.id
            )));
        }
        query.push(("transaction_id", tx.id.clone()));
        let body = body.map(serde_json::to_value).transpose()?;
        self.request(method.clone(), path, &query, body).await?;
        debug!(transaction = %tx.id, method = %method, path, "Proxy mutation applied");
        tx.record(&method, path);
        Ok(())
    }

    // ==================== Health and version ====================

    /// Liveness probe against `GET /info`
    pub async fn is_reachable(&self) -> bool {
        match self.request(Method::GET, "/info", &[], None).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Proxy liveness probe failed");
                false
            }
        }
    }

    async fn ensure_reachable(&self, operation: &str) -> Result<()> {
        if self.is_reachable().await {
            Ok(())
        } else {
            Err(DeployError::ProxyUnreachable(format!(
                "{} needs the proxy at {}",
                operation, self.base_url
            )))
        }
    }

    /// Current configuration version, 1 when the proxy does not report one
    pub async fn next_version(&self) -> Result<u64> {
        let raw = self
            .request(Method::GET, &format!("{}/raw", CONFIGURATION), &[], None)
            .await?;
        Ok(raw.get("_version").and_then(Value::as_u64).unwrap_or(1))
    }

    /// Recent reloads of the proxy process
    pub async fn reload_status(&self) -> Result<Vec<Reload>> {
        Ok(self
            .get_data("/services/haproxy/reloads", &[])
            .await?
            .unwrap_or_default())
    }

    // ==================== Transactions ====================

    pub async fn begin(&self) -> Result<Transaction> {
        let version = self.next_version().await?;
        let response = self
            .request(
                Method::POST,
                TRANSACTIONS,
                &[("version", version.to_string())],
                None,
            )
            .await?;
        let id = response
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                DeployError::Serialization("transaction response has no id".to_string())
            })?
            .to_string();
        debug!(transaction = %id, version, "Proxy transaction started");
        Ok(Transaction::new(id, version))
    }

    pub async fn commit(&self, tx: &mut Transaction) -> Result<()> {
        let path = format!("{}/{}", TRANSACTIONS, tx.id);
        match self.request(Method::PUT, &path, &[], None).await {
            Ok(_) => {
                tx.state = TransactionState::Committed;
                info!(transaction = %tx.id, ops = tx.ops.len(), "Proxy transaction committed");
                Ok(())
            }
            Err(DeployError::ProxyApi {
                status: 406 | 409,
                body,
                ..
            }) => {
                tx.state = TransactionState::Conflicted;
                warn!(transaction = %tx.id, version = tx.version, "Proxy transaction conflicted");
                Err(DeployError::TransactionConflict {
                    transaction_id: tx.id.clone(),
                    message: body,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn discard(&self, tx: &mut Transaction) -> Result<()> {
        let path = format!("{}/{}", TRANSACTIONS, tx.id);
        self.request(Method::DELETE, &path, &[], None).await?;
        tx.state = TransactionState::Discarded;
        info!(transaction = %tx.id, ops = tx.ops.len(), "Proxy transaction discarded");
        Ok(())
    }

    /// Terminate `tx` according to `outcome` and the failure policy
    pub async fn finish<T>(&self, mut tx: Transaction, outcome: Result<T>) -> Result<T> {
        match outcome {
            Ok(value) => {
                if let Err(e) = self.commit(&mut tx).await {
                    if tx.is_open() {
                        if let Err(discard_err) = self.discard(&mut tx).await {
                            warn!(transaction = %tx.id, error = %discard_err, "Failed to discard transaction");
                        }
                    }
                    return Err(e);
                }
                Ok(value)
            }
            Err(err) => {
                warn!(
                    transaction = %tx.id,
                    error = %err,
                    policy = ?self.failure_policy,
                    "Proxy configuration step failed"
                );
                let terminal = match self.failure_policy {
                    FailurePolicy::Discard => self.discard(&mut tx).await,
                    FailurePolicy::Commit => self.commit(&mut tx).await,
                };
                if let Err(e) = terminal {
                    warn!(transaction = %tx.id, error = %e, "Terminal transaction call failed");
                }
                Err(err)
            }
        }
    }

    // ==================== Reads ====================

    pub async fn get_backend(&self, name: &str) -> Result<Option<Backend>> {
        self.get_data(&format!("{}/backends/{}", CONFIGURATION, name), &[])
            .await
    }

    pub async fn get_server(&self, backend: &str, name: &str) -> Result<Option<Server>> {
        self.get_data(
            &format!("{}/servers/{}", CONFIGURATION, name),
            &[("backend", backend.to_string())],
        )
        .await
    }

    pub async fn get_frontend(&self, name: &str) -> Result<Option<Frontend>> {
        self.get_data(&format!("{}/frontends/{}", CONFIGURATION, name), &[])
            .await
    }

    pub async fn get_bind(&self, frontend: &str, name: &str) -> Result<Option<Bind>> {
        self.get_data(
            &format!("{}/binds/{}", CONFIGURATION, name),
            &[("frontend", frontend.to_string())],
        )
        .await
    }

    pub async fn http_request_rules(&self, frontend: &str) -> Result<Vec<HttpRequestRule>> {
        Ok(self
            .get_data(
                &format!("{}/http_request_rules", CONFIGURATION),
                &parent(frontend),
            )
            .await?
            .unwrap_or_default())
    }

    pub async fn tcp_request_rules(&self, frontend: &str) -> Result<Vec<TcpRequestRule>> {
        Ok(self
            .get_data(
                &format!("{}/tcp_request_rules", CONFIGURATION),
                &parent(frontend),
            )
            .await?
            .unwrap_or_default())
    }

    // ==================== Mutations ====================

    pub async fn create_backend(&self, tx: &mut Transaction, backend: &Backend) -> Result<()> {
        let path = format!("{}/backends", CONFIGURATION);
        self.mutate(tx, Method::POST, &path, vec![], Some(backend))
            .await
    }

    pub async fn delete_backend(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        let path = format!("{}/backends/{}", CONFIGURATION, name);
        self.mutate::<()>(tx, Method::DELETE, &path, vec![], None)
            .await
    }

    pub async fn create_server(
        &self,
        tx: &mut Transaction,
        backend: &str,
        server: &Server,
    ) -> Result<()> {
        let path = format!("{}/servers", CONFIGURATION);
        self.mutate(
            tx,
            Method::POST,
            &path,
            vec![("backend", backend.to_string())],
            Some(server),
        )
        .await
    }

    pub async fn create_frontend(&self, tx: &mut Transaction, frontend: &Frontend) -> Result<()> {
        let path = format!("{}/frontends", CONFIGURATION);
        self.mutate(tx, Method::POST, &path, vec![], Some(frontend))
            .await
    }

    pub async fn delete_frontend(&self, tx: &mut Transaction, name: &str) -> Result<()> {
        let path = format!("{}/frontends/{}", CONFIGURATION, name);
        self.mutate::<()>(tx, Method::DELETE, &path, vec![], None)
            .await
    }

    pub async fn create_bind(&self, tx: &mut Transaction, frontend: &str, bind: &Bind) -> Result<()> {
        let path = format!("{}/binds", CONFIGURATION);
        self.mutate(
            tx,
            Method::POST,
            &path,
            vec![("frontend", frontend.to_string())],
            Some(bind),
        )
        .await
    }

    pub async fn add_http_request_rule(
        &self,
        tx: &mut Transaction,
        frontend: &str,
        rule: &HttpRequestRule,
    ) -> Result<()> {
        let path = format!("{}/http_request_rules", CONFIGURATION);
        self.mutate(tx, Method::POST, &path, parent(frontend), Some(rule))
            .await
    }

    pub async fn delete_http_request_rule(
        &self,
        tx: &mut Transaction,
        frontend: &str,
        index: u32,
    ) -> Result<()> {
        let path = format!("{}/http_request_rules/{}", CONFIGURATION, index);
        self.mutate::<()>(tx, Method::DELETE, &path, parent(frontend), None)
            .await
    }

    pub async fn add_tcp_request_rule(
        &self,
        tx: &mut Transaction,
        frontend: &str,
        rule: &TcpRequestRule,
    ) -> Result<()> {
        let path = format!("{}/tcp_request_rules", CONFIGURATION);
        self.mutate(tx, Method::POST, &path, parent(frontend), Some(rule))
            .await
    }

    pub async fn delete_tcp_request_rule(
        &self,
        tx: &mut Transaction,
        frontend: &str,
        index: u32,
    ) -> Result<()> {
        let path = format!("{}/tcp_request_rules/{}", CONFIGURATION, index);
        self.mutate::<()>(tx, Method::DELETE, &path, parent(frontend), None)
            .await
    }

    // ==================== Application routing ====================

    /// Whether `domain` already routes to `app_id:port` with forwarding on
    pub async fn application_routed(&self, domain: &str, app_id: &str, port: u16) -> Result<bool> {
        let Some(backend) = self.get_backend(domain).await? else {
            return Ok(false);
        };
        let forwardfor = backend
            .forwardfor
            .as_ref()
            .is_some_and(|f| f.enabled == "enabled");
        if !forwardfor || backend.name != domain {
            return Ok(false);
        }

        let Some(server) = self.get_server(domain, app_id).await? else {
            return Ok(false);
        };
        Ok(server.check.as_deref() == Some("enabled")
            && server.address == app_id
            && server.port == Some(port))
    }

    /// Route HTTP traffic for `domain` to the container `app_id` on `port`
    pub async fn configure_application(
        &self,
        domain: &str,
        app_id: &str,
        port: u16,
        force_ssl: bool,
    ) -> Result<RoutingOutcome> {
        if !self.is_reachable().await {
            warn!(domain, app = app_id, "Proxy unreachable, skipping application routing");
            return Ok(RoutingOutcome::Skipped);
        }

        let mut outcome = if self.application_routed(domain, app_id, port).await? {
            debug!(domain, app = app_id, "Application routing already up to date");
            RoutingOutcome::Unchanged
        } else {
            let mut tx = self.begin().await?;
            let applied = self.apply_application(&mut tx, domain, app_id, port).await;
            self.finish(tx, applied).await?;
            info!(domain, app = app_id, port, "Application routing configured");
            RoutingOutcome::Applied
        };

        // keep the redirect in step with the descriptor in both directions
        let redirect = if force_ssl {
            self.force_ssl_on(domain).await?
        } else {
            self.remove_ssl_redirect(domain).await?
        };
        if redirect == RoutingOutcome::Applied {
            outcome = RoutingOutcome::Applied;
        }
        Ok(outcome)
    }

    async fn apply_application(
        &self,
        tx: &mut Transaction,
        domain: &str,
        app_id: &str,
        port: u16,
    ) -> Result<()> {
        if self.get_backend(domain).await?.is_some() {
            self.delete_backend(tx, domain).await?;
        }
        let backend = Backend {
            name: domain.to_string(),
            mode: None,
            init_addr: Some(INIT_ADDR.to_string()),
            forwardfor: Some(Forwardfor {
                enabled: "enabled".to_string(),
            }),
        };
        self.create_backend(tx, &backend).await?;
        let server = Server {
            name: app_id.to_string(),
            address: app_id.to_string(),
            port: Some(port),
            check: Some("enabled".to_string()),
        };
        self.create_server(tx, domain, &server).await
    }

    /// Route the control plane's own domain, always with forced TLS
    pub async fn configure_self_route(
        &self,
        domain: &str,
        address: &str,
        port: u16,
    ) -> Result<RoutingOutcome> {
        self.configure_application(domain, address, port, true)
            .await
    }

    /// Remove the backend of `domain` and its HTTPS redirect
    pub async fn remove_application(&self, domain: &str) -> Result<()> {
        self.ensure_reachable("application removal").await?;

        if self.get_backend(domain).await?.is_some() {
            let mut tx = self.begin().await?;
            let deleted = self.delete_backend(&mut tx, domain).await;
            self.finish(tx, deleted).await?;
            info!(domain, "Application routing removed");
        }
        self.force_ssl_off(domain).await?;
        Ok(())
    }

    // ==================== Forced TLS ====================

    /// Redirect plain HTTP for `domain` to HTTPS
    pub async fn force_ssl_on(&self, domain: &str) -> Result<RoutingOutcome> {
        if !self.is_reachable().await {
            warn!(domain, "Proxy unreachable, skipping HTTPS redirect");
            return Ok(RoutingOutcome::Skipped);
        }

        let rules = self.http_request_rules(&self.http_frontend).await?;
        if rules.iter().any(|r| r.matches_domain(domain)) {
            return Ok(RoutingOutcome::Unchanged);
        }

        let index = next_rule_index(rules.iter().map(|r| r.index));
        let rule = HttpRequestRule::ssl_redirect(domain, index);

        let mut tx = self.begin().await?;
        let added = self
            .add_http_request_rule(&mut tx, &self.http_frontend, &rule)
            .await;
        self.finish(tx, added).await?;
        info!(domain, index, "HTTPS redirect enabled");
        Ok(RoutingOutcome::Applied)
    }

    /// Remove the HTTPS redirect for `domain`, if any
    pub async fn force_ssl_off(&self, domain: &str) -> Result<RoutingOutcome> {
        self.ensure_reachable("HTTPS redirect removal").await?;
        self.remove_ssl_redirect(domain).await
    }

    async fn remove_ssl_redirect(&self, domain: &str) -> Result<RoutingOutcome> {
        let rules = self.http_request_rules(&self.http_frontend).await?;
        let Some(rule) = rules.iter().find(|r| r.matches_domain(domain)) else {
            return Ok(RoutingOutcome::Unchanged);
        };

        let mut tx = self.begin().await?;
        let deleted = self
            .delete_http_request_rule(&mut tx, &self.http_frontend, rule.index)
            .await;
        self.finish(tx, deleted).await?;
        info!(domain, index = rule.index, "HTTPS redirect removed");
        Ok(RoutingOutcome::Applied)
    }

    // ==================== Database routing ====================

    async fn database_routed(&self, id: &str, public_port: u16, private_port: u16) -> Result<bool> {
        let Some(backend) = self.get_backend(id).await? else {
            return Ok(false);
        };
        if backend.name != id || backend.mode.as_deref() != Some("tcp") {
            return Ok(false);
        }
        let Some(server) = self.get_server(id, id).await? else {
            return Ok(false);
        };
        if server.check.as_deref() != Some("enabled")
            || server.address != id
            || server.port != Some(private_port)
        {
            return Ok(false);
        }
        let Some(bind) = self.get_bind(id, id).await? else {
            return Ok(false);
        };
        Ok(bind.port == Some(public_port))
    }

    /// Expose database `id` on `public_port` of the proxy
    pub async fn configure_database(
        &self,
        id: &str,
        public_port: u16,
        private_port: u16,
    ) -> Result<RoutingOutcome> {
        if !self.is_reachable().await {
            warn!(database = id, "Proxy unreachable, skipping database routing");
            return Ok(RoutingOutcome::Skipped);
        }

        if self.database_routed(id, public_port, private_port).await? {
            debug!(database = id, "Database routing already up to date");
            return Ok(RoutingOutcome::Unchanged);
        }

        let mut tx = self.begin().await?;
        let applied = self
            .apply_database(&mut tx, id, public_port, private_port)
            .await;
        self.finish(tx, applied).await?;
        info!(database = id, public_port, private_port, "Database routing configured");
        Ok(RoutingOutcome::Applied)
    }

    async fn apply_database(
        &self,
        tx: &mut Transaction,
        id: &str,
        public_port: u16,
        private_port: u16,
    ) -> Result<()> {
        if self.get_frontend(id).await?.is_some() {
            self.delete_frontend(tx, id).await?;
        }
        if self.get_backend(id).await?.is_some() {
            self.delete_backend(tx, id).await?;
        }

        let backend = Backend {
            name: id.to_string(),
            mode: Some("tcp".to_string()),
            init_addr: Some(INIT_ADDR.to_string()),
            forwardfor: None,
        };
        self.create_backend(tx, &backend).await?;

        let server = Server {
            name: id.to_string(),
            address: id.to_string(),
            port: Some(private_port),
            check: Some("enabled".to_string()),
        };
        self.create_server(tx, id, &server).await?;

        let frontend = Frontend {
            name: id.to_string(),
            mode: Some("tcp".to_string()),
            default_backend: Some(id.to_string()),
        };
        self.create_frontend(tx, &frontend).await?;

        let bind = Bind {
            name: id.to_string(),
            address: "*".to_string(),
            port: Some(public_port),
        };
        self.create_bind(tx, id, &bind).await
    }

    /// Restrict (`private`) or open the TCP frontend of database `id`
    pub async fn set_database_visibility(
        &self,
        id: &str,
        private: bool,
        subnet: &str,
    ) -> Result<RoutingOutcome> {
        self.ensure_reachable("database visibility change").await?;

        let rules = self.tcp_request_rules(id).await?;
        let has_rule = rules.iter().any(|r| r.index == 0);

        if private == has_rule {
            return Ok(RoutingOutcome::Unchanged);
        }

        let mut tx = self.begin().await?;
        let changed = if private {
            self.add_tcp_request_rule(&mut tx, id, &TcpRequestRule::accept_subnet(subnet))
                .await
        } else {
            self.delete_tcp_request_rule(&mut tx, id, 0).await
        };
        self.finish(tx, changed).await?;
        info!(database = id, private, "Database visibility changed");
        Ok(RoutingOutcome::Applied)
    }

    /// Remove the TCP frontend and backend of database `id`
    pub async fn remove_database(&self, id: &str) -> Result<()> {
        self.ensure_reachable("database removal").await?;

        let frontend = self.get_frontend(id).await?.is_some();
        let backend = self.get_backend(id).await?.is_some();
        if !frontend && !backend {
            return Ok(());
        }

        let mut tx = self.begin().await?;
        let removed = async {
            if frontend {
                self.delete_frontend(&mut tx, id).await?;
            }
            if backend {
                self.delete_backend(&mut tx, id).await?;
            }
            Ok::<(), DeployError>(())
        }
        .await;
        self.finish(tx, removed).await?;
        info!(database = id, "Database routing removed");
        Ok(())
    }
}

fn parent(frontend: &str) -> Vec<(&'static str, String)> {
    vec![
        ("parent_name", frontend.to_string()),
        ("parent_type", "frontend".to_string()),
    ]
}

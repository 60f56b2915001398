//! Databricks SQL Statement Execution API client
//!
//! Submits each [`Statement`] to `POST /api/2.0/sql/statements` on a SQL
//! warehouse with inline JSON results. Statements that outlive the server-side
//! wait are polled until they reach a terminal state; results split into chunks
//! are followed through their internal links.
//!
//! # Example
//!
//! ```rust,no_run
//! use warehouse_checkpoint::warehouse::{DatabricksConfig, DatabricksWarehouse};
//!
//! # fn main() -> warehouse_checkpoint::Result<()> {
//! // DATABRICKS_HOST, DATABRICKS_TOKEN, DATABRICKS_SQL_WAREHOUSE_ID
//! let config = DatabricksConfig::from_env()?;
//! let warehouse = DatabricksWarehouse::new(config)?;
//! # Ok(())
//! # }
//! ```

use super::{ResultSet, SqlDialect, Statement, WarehouseClient};
use crate::config::{get_env_parse_or, require_env};
use crate::error::{Result, WarehouseError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Connection settings for a Databricks SQL warehouse
#[derive(Debug, Clone)]
pub struct DatabricksConfig {
    /// Workspace URL, e.g. `https://adb-123.4.azuredatabricks.net`
    pub host: String,

    /// Personal access or OAuth token
    pub token: String,

    /// SQL warehouse that executes the statements
    pub warehouse_id: String,

    /// Server-side wait before the call returns a pending statement (0 or 5..=50 s)
    pub wait_timeout: Duration,

    /// Delay between polls of a pending statement
    pub poll_interval: Duration,

    /// Polls before a pending statement is cancelled and reported unavailable
    pub max_polls: u32,

    /// Timeout of each HTTP request
    pub request_timeout: Duration,
}

impl DatabricksConfig {
    pub fn new(
        host: impl Into<String>,
        token: impl Into<String>,
        warehouse_id: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
            token: token.into(),
            warehouse_id: warehouse_id.into(),
            wait_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            max_polls: 120,
            request_timeout: Duration::from_secs(60),
        }
    }

    /// Read `DATABRICKS_HOST`, `DATABRICKS_TOKEN` and `DATABRICKS_SQL_WAREHOUSE_ID`
    ///
    /// `DATABRICKS_STATEMENT_WAIT_SECS` and `DATABRICKS_STATEMENT_MAX_POLLS` are optional.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(
            require_env("DATABRICKS_HOST")?,
            require_env("DATABRICKS_TOKEN")?,
            require_env("DATABRICKS_SQL_WAREHOUSE_ID")?,
        );
        config.wait_timeout =
            Duration::from_secs(get_env_parse_or("DATABRICKS_STATEMENT_WAIT_SECS", 30u64)?);
        config.max_polls = get_env_parse_or("DATABRICKS_STATEMENT_MAX_POLLS", config.max_polls)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = max_polls;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() || self.warehouse_id.is_empty() {
            return Err(WarehouseError::Config(
                "Databricks host and warehouse id are required".to_string(),
            ));
        }
        let wait = self.wait_timeout.as_secs();
        if wait != 0 && !(5..=50).contains(&wait) {
            return Err(WarehouseError::Config(format!(
                "wait_timeout must be 0 or between 5 and 50 seconds, got {}",
                wait
            )));
        }
        Ok(())
    }
}

/// Warehouse client speaking the Databricks SQL Statement Execution API
#[derive(Clone)]
pub struct DatabricksWarehouse {
    config: DatabricksConfig,
    client: Client,
}

impl std::fmt::Debug for DatabricksWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabricksWarehouse")
            .field("host", &self.config.host)
            .field("warehouse_id", &self.config.warehouse_id)
            .finish()
    }
}

impl DatabricksWarehouse {
    pub fn new(config: DatabricksConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| WarehouseError::Config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &DatabricksConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.host, path)
    }

    async fn send<T: for<'de> Deserialize<'de>>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let response = request.bearer_auth(&self.config.token).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status, body));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| WarehouseError::malformed(format!("statement response: {}", e)))
    }

    async fn cancel(&self, statement_id: &str) {
        let url = self.url(&format!("/api/2.0/sql/statements/{}/cancel", statement_id));
        let result = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await;
        if let Err(err) = result {
            warn!(statement_id, "Failed to cancel statement: {}", err);
        }
    }

    async fn fetch_chunks(&self, mut result: ResultSet, mut next: Option<String>) -> Result<ResultSet> {
        while let Some(link) = next {
            let chunk: ResultData = self.send(self.client.get(self.url(&link))).await?;
            result.rows.extend(chunk.data_array.unwrap_or_default());
            next = chunk.next_chunk_internal_link;
        }
        Ok(result)
    }
}

#[async_trait]
impl WarehouseClient for DatabricksWarehouse {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Databricks
    }

    async fn execute(&self, statement: &Statement) -> Result<ResultSet> {
        debug!(
            label = statement.label,
            parameters = statement.parameters.len(),
            "Submitting statement to Databricks"
        );

        let request = StatementRequest::new(statement, &self.config);
        let mut response: StatementResponse = self
            .send(self.client.post(self.url("/api/2.0/sql/statements")).json(&request))
            .await?;

        let mut polls = 0;
        loop {
            match response.outcome()? {
                StatementOutcome::Done { result, next_chunk } => {
                    return self.fetch_chunks(result, next_chunk).await;
                }
                StatementOutcome::Pending(statement_id) => {
                    if polls >= self.config.max_polls {
                        self.cancel(&statement_id).await;
                        return Err(WarehouseError::Unavailable(format!(
                            "statement {} still pending after {} polls",
                            statement_id, polls
                        )));
                    }
                    polls += 1;
                    tokio::time::sleep(self.config.poll_interval).await;
                    let url = self.url(&format!("/api/2.0/sql/statements/{}", statement_id));
                    response = self.send(self.client.get(&url)).await?;
                }
            }
        }
    }
}

fn http_error(status: StatusCode, body: String) -> WarehouseError {
    let message = format!("Databricks API error {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        WarehouseError::Unavailable(message)
    } else {
        WarehouseError::Backend(message)
    }
}

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    warehouse_id: &'a str,
    parameters: Vec<ParameterPayload<'a>>,
    wait_timeout: String,
    on_wait_timeout: &'static str,
    format: &'static str,
    disposition: &'static str,
}

#[derive(Debug, Serialize)]
struct ParameterPayload<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a str>,
    #[serde(rename = "type")]
    type_name: &'static str,
}

impl<'a> StatementRequest<'a> {
    fn new(statement: &'a Statement, config: &'a DatabricksConfig) -> Self {
        Self {
            statement: &statement.sql,
            warehouse_id: &config.warehouse_id,
            parameters: statement
                .parameters
                .iter()
                .map(|p| ParameterPayload {
                    name: &p.name,
                    value: p.value.as_deref(),
                    type_name: p.type_name.as_str(),
                })
                .collect(),
            wait_timeout: format!("{}s", config.wait_timeout.as_secs()),
            on_wait_timeout: "CONTINUE",
            format: "JSON_ARRAY",
            disposition: "INLINE",
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    statement_id: String,
    status: StatementStatus,
    #[serde(default)]
    manifest: Option<Manifest>,
    #[serde(default)]
    result: Option<ResultData>,
}

#[derive(Debug, Deserialize)]
struct StatementStatus {
    state: String,
    #[serde(default)]
    error: Option<ServiceError>,
}

#[derive(Debug, Deserialize)]
struct ServiceError {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    schema: ManifestSchema,
}

#[derive(Debug, Deserialize)]
struct ManifestSchema {
    #[serde(default)]
    columns: Vec<ManifestColumn>,
}

#[derive(Debug, Deserialize)]
struct ManifestColumn {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ResultData {
    #[serde(default)]
    data_array: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    next_chunk_internal_link: Option<String>,
}

#[derive(Debug)]
enum StatementOutcome {
    Pending(String),
    Done {
        result: ResultSet,
        next_chunk: Option<String>,
    },
}

impl StatementResponse {
    fn outcome(&mut self) -> Result<StatementOutcome> {
        match self.status.state.as_str() {
            "PENDING" | "RUNNING" => Ok(StatementOutcome::Pending(self.statement_id.clone())),
            "SUCCEEDED" => {
                let columns = self
                    .manifest
                    .take()
                    .map(|m| m.schema.columns.into_iter().map(|c| c.name).collect())
                    .unwrap_or_default();
                let (rows, next_chunk) = match self.result.take() {
                    Some(data) => (data.data_array.unwrap_or_default(), data.next_chunk_internal_link),
                    None => (Vec::new(), None),
                };
                Ok(StatementOutcome::Done {
                    result: ResultSet::new(columns, rows),
                    next_chunk,
                })
            }
            state => {
                let detail = self
                    .status
                    .error
                    .as_ref()
                    .map(|e| {
                        format!(
                            "{}: {}",
                            e.error_code.as_deref().unwrap_or("UNKNOWN"),
                            e.message.as_deref().unwrap_or("no message")
                        )
                    })
                    .unwrap_or_else(|| "no error detail".to_string());
                let message = format!("statement {} {}: {}", self.statement_id, state, detail);
                if self.status.error.as_ref().is_some_and(ServiceError::is_concurrent_modification) {
                    Err(WarehouseError::Unavailable(message))
                } else {
                    Err(WarehouseError::Backend(message))
                }
            }
        }
    }
}

/// Delta rejects the losing side of two concurrent commits to the same table.
/// Re-running the statement observes the winner's rows.
const CONCURRENT_MODIFICATION_MARKERS: &[&str] = &[
    "DELTA_CONCURRENT_APPEND",
    "DELTA_CONCURRENT_DELETE_READ",
    "DELTA_CONCURRENT_DELETE_DELETE",
    "DELTA_CONCURRENT_WRITE",
    "ConcurrentAppendException",
    "ConcurrentDeleteReadException",
];

impl ServiceError {
    fn is_concurrent_modification(&self) -> bool {
        [self.error_code.as_deref(), self.message.as_deref()]
            .into_iter()
            .flatten()
            .any(|text| CONCURRENT_MODIFICATION_MARKERS.iter().any(|marker| text.contains(marker)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> StatementResponse {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_request_payload_shape() {
        let config = DatabricksConfig::new("https://example.cloud.databricks.com/", "tok", "wh-1");
        let statement = Statement::new("get", "SELECT * FROM t WHERE a = :a AND b = :b")
            .bind("a", "x")
            .bind_opt("b", None::<String>);

        let payload = serde_json::to_value(StatementRequest::new(&statement, &config)).unwrap();
        assert_eq!(payload["warehouse_id"], "wh-1");
        assert_eq!(payload["wait_timeout"], "30s");
        assert_eq!(payload["format"], "JSON_ARRAY");
        assert_eq!(payload["parameters"][0], json!({"name": "a", "value": "x", "type": "STRING"}));
        assert_eq!(payload["parameters"][1], json!({"name": "b", "type": "STRING"}));
        assert_eq!(config.host, "https://example.cloud.databricks.com");
    }

    #[test]
    fn test_succeeded_response_yields_named_columns() {
        let mut response = parse(json!({
            "statement_id": "01ef",
            "status": {"state": "SUCCEEDED"},
            "manifest": {"schema": {"columns": [
                {"name": "checkpoint_id", "position": 0, "type_name": "STRING"},
                {"name": "parent_checkpoint_id", "position": 1, "type_name": "STRING"}
            ]}},
            "result": {"data_array": [["b", "a"], ["a", null]]}
        }));

        match response.outcome().unwrap() {
            StatementOutcome::Done { result, next_chunk } => {
                assert_eq!(result.columns, vec!["checkpoint_id", "parent_checkpoint_id"]);
                assert_eq!(result.len(), 2);
                let second = result.iter().nth(1).unwrap();
                assert_eq!(second.opt_string("parent_checkpoint_id").unwrap(), None);
                assert!(next_chunk.is_none());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_statement_without_rows_is_empty_result() {
        let mut response = parse(json!({
            "statement_id": "01ef",
            "status": {"state": "SUCCEEDED"},
            "manifest": {"schema": {"columns": []}}
        }));
        match response.outcome().unwrap() {
            StatementOutcome::Done { result, .. } => assert!(result.is_empty()),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_pending_response_is_polled() {
        let mut response = parse(json!({"statement_id": "01ef", "status": {"state": "RUNNING"}}));
        assert!(matches!(response.outcome().unwrap(), StatementOutcome::Pending(id) if id == "01ef"));
    }

    #[test]
    fn test_failed_response_is_backend_error() {
        let mut response = parse(json!({
            "statement_id": "01ef",
            "status": {"state": "FAILED", "error": {"error_code": "BAD_REQUEST", "message": "TABLE_OR_VIEW_NOT_FOUND"}}
        }));
        let err = response.outcome().unwrap_err();
        assert!(matches!(&err, WarehouseError::Backend(msg) if msg.contains("TABLE_OR_VIEW_NOT_FOUND")));
    }

    #[test]
    fn test_concurrent_commit_failure_is_retryable() {
        let mut response = parse(json!({
            "statement_id": "01ef",
            "status": {"state": "FAILED", "error": {
                "error_code": "DELTA_CONCURRENT_APPEND",
                "message": "[DELTA_CONCURRENT_APPEND] Files were added to the root of the table by a concurrent update."
            }}
        }));
        let err = response.outcome().unwrap_err();
        assert!(matches!(&err, WarehouseError::Unavailable(msg) if msg.contains("DELTA_CONCURRENT_APPEND")));
        assert!(err.is_retryable());

        // Older runtimes only name the exception class in the message
        let mut response = parse(json!({
            "statement_id": "01ef",
            "status": {"state": "FAILED", "error": {
                "error_code": "INTERNAL_ERROR",
                "message": "io.delta.exceptions.ConcurrentAppendException: Files were added"
            }}
        }));
        assert!(response.outcome().unwrap_err().is_retryable());
    }

    #[test]
    fn test_http_errors_classify_transient_statuses() {
        assert!(http_error(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(http_error(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_retryable());
        assert!(!http_error(StatusCode::FORBIDDEN, String::new()).is_retryable());
    }

    mod scripted {
        use super::*;
        use std::sync::{Arc, Mutex};
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::{TcpListener, TcpStream};

        /// Answers each incoming request with the next scripted response,
        /// recording the request lines it saw.
        pub(super) struct ScriptedServer {
            pub host: String,
            requests: Arc<Mutex<Vec<String>>>,
        }

        impl ScriptedServer {
            pub async fn start(script: Vec<(u16, serde_json::Value)>) -> Self {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let host = format!("http://{}", listener.local_addr().unwrap());
                let requests = Arc::new(Mutex::new(Vec::new()));
                let seen = requests.clone();
                tokio::spawn(async move {
                    for (status, body) in script {
                        let (mut socket, _) = listener.accept().await.unwrap();
                        let request_line = read_request(&mut socket).await;
                        seen.lock().unwrap().push(request_line);
                        let body = body.to_string();
                        let response = format!(
                            "HTTP/1.1 {} Scripted\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                            status,
                            body.len(),
                            body
                        );
                        socket.write_all(response.as_bytes()).await.unwrap();
                        socket.shutdown().await.ok();
                    }
                });
                Self { host, requests }
            }

            pub fn requests(&self) -> Vec<String> {
                self.requests.lock().unwrap().clone()
            }

            pub fn warehouse(&self, max_polls: u32) -> DatabricksWarehouse {
                let config = DatabricksConfig::new(&self.host, "token", "wh-1")
                    .with_wait_timeout(Duration::from_secs(0))
                    .with_poll_interval(Duration::from_millis(1))
                    .with_max_polls(max_polls);
                DatabricksWarehouse::new(config).unwrap()
            }
        }

        async fn read_request(socket: &mut TcpStream) -> String {
            let mut buffer = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buffer.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buffer);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if buffer.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            let text = String::from_utf8_lossy(&buffer);
            let mut parts = text.lines().next().unwrap_or_default().split_whitespace();
            format!("{} {}", parts.next().unwrap_or_default(), parts.next().unwrap_or_default())
        }
    }

    use scripted::ScriptedServer;

    fn select_one() -> Statement {
        Statement::new("select", "SELECT 1 AS one")
    }

    #[tokio::test]
    async fn test_execute_polls_until_succeeded() {
        let server = ScriptedServer::start(vec![
            (200, json!({"statement_id": "s1", "status": {"state": "PENDING"}})),
            (200, json!({"statement_id": "s1", "status": {"state": "RUNNING"}})),
            (200, json!({
                "statement_id": "s1",
                "status": {"state": "SUCCEEDED"},
                "manifest": {"schema": {"columns": [{"name": "one"}]}},
                "result": {"data_array": [["1"]]}
            })),
        ])
        .await;

        let result = server.warehouse(10).execute(&select_one()).await.unwrap();
        assert_eq!(result.first().unwrap().i64("one").unwrap(), 1);
        assert_eq!(
            server.requests(),
            vec![
                "POST /api/2.0/sql/statements",
                "GET /api/2.0/sql/statements/s1",
                "GET /api/2.0/sql/statements/s1",
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_cancels_after_max_polls() {
        let server = ScriptedServer::start(vec![
            (200, json!({"statement_id": "s1", "status": {"state": "PENDING"}})),
            (200, json!({"statement_id": "s1", "status": {"state": "RUNNING"}})),
            (200, json!({})),
        ])
        .await;

        let err = server.warehouse(1).execute(&select_one()).await.unwrap_err();
        assert!(matches!(&err, WarehouseError::Unavailable(msg) if msg.contains("s1")));
        assert_eq!(
            server.requests(),
            vec![
                "POST /api/2.0/sql/statements",
                "GET /api/2.0/sql/statements/s1",
                "POST /api/2.0/sql/statements/s1/cancel",
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_follows_result_chunks() {
        let server = ScriptedServer::start(vec![
            (200, json!({
                "statement_id": "s1",
                "status": {"state": "SUCCEEDED"},
                "manifest": {"schema": {"columns": [{"name": "key"}]}},
                "result": {
                    "data_array": [["a"]],
                    "next_chunk_internal_link": "/api/2.0/sql/statements/s1/result/chunks/1"
                }
            })),
            (200, json!({
                "chunk_index": 1,
                "data_array": [["b"], ["c"]],
                "next_chunk_internal_link": "/api/2.0/sql/statements/s1/result/chunks/2"
            })),
            (200, json!({"chunk_index": 2, "data_array": [["d"]]})),
        ])
        .await;

        let result = server.warehouse(10).execute(&select_one()).await.unwrap();
        let keys: Vec<&str> = result.iter().map(|row| row.string("key").unwrap()).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d"]);
        assert_eq!(
            server.requests(),
            vec![
                "POST /api/2.0/sql/statements",
                "GET /api/2.0/sql/statements/s1/result/chunks/1",
                "GET /api/2.0/sql/statements/s1/result/chunks/2",
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_maps_throttling_and_outages_to_unavailable() {
        let server = ScriptedServer::start(vec![
            (429, json!({"error_code": "TOO_MANY_REQUESTS", "message": "slow down"})),
            (503, json!({"error_code": "TEMPORARILY_UNAVAILABLE", "message": "warehouse starting"})),
            (400, json!({"error_code": "INVALID_PARAMETER_VALUE", "message": "bad statement"})),
        ])
        .await;
        let warehouse = server.warehouse(10);

        let throttled = warehouse.execute(&select_one()).await.unwrap_err();
        assert!(matches!(&throttled, WarehouseError::Unavailable(msg) if msg.contains("slow down")));

        let starting = warehouse.execute(&select_one()).await.unwrap_err();
        assert!(matches!(&starting, WarehouseError::Unavailable(msg) if msg.contains("warehouse starting")));

        let rejected = warehouse.execute(&select_one()).await.unwrap_err();
        assert!(matches!(&rejected, WarehouseError::Backend(_)));
    }

    #[test]
    fn test_config_rejects_out_of_range_wait() {
        let config = DatabricksConfig::new("https://h", "t", "w").with_wait_timeout(Duration::from_secs(3));
        assert!(config.validate().is_err());
        let config = DatabricksConfig::new("https://h", "t", "w").with_wait_timeout(Duration::from_secs(0));
        assert!(config.validate().is_ok());
    }
}

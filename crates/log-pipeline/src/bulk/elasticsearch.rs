//! Elasticsearch bulk 백엔드
//!
//! reqwest로 `_bulk` API에 NDJSON 요청을 보냅니다. 버전별 차이는 [`Dialect`]가
//! 흡수하고, [`Dialect::for_version`]이 로그 옵션의 버전으로 구현을 고릅니다.
//!
//! | 버전 | `_type` 전송 | 아이템 에러 형식 |
//! |------|-------------|------------------|
//! | 1 | O | 문자열 |
//! | 2, 5, 6 | O | `{"type", "reason"}` 객체 |
//! | 7 | X | `{"type", "reason"}` 객체 |
//!
//! 연결 시 `GET /`로 접근 가능 여부를 확인하고, 노드 탐색이 켜져 있으면
//! `GET /_nodes/http`의 publish address 목록으로 요청을 라운드로빈합니다.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{BackendVersion, LogOpts};
use crate::error::LogPipelineError;

use super::Batch;
use super::client::{BulkClient, ClientFactory, CommitError, CommitResult, ItemStatus};

/// 단일 요청 전체 타임아웃
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// 거부 응답 본문을 로그에 남길 최대 길이
const MAX_REASON_LEN: usize = 512;

/// 백엔드 버전별 요청/응답 형식
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// 1.x: 에러가 문자열
    V1,
    /// 2.x ~ 6.x: 문서 타입 사용, 에러가 객체
    Typed,
    /// 7.x: 문서 타입 없음
    Typeless,
}

impl Dialect {
    /// 버전에 맞는 형식을 고릅니다.
    pub fn for_version(version: BackendVersion) -> Self {
        match version {
            BackendVersion::V1 => Self::V1,
            BackendVersion::V2 | BackendVersion::V5 | BackendVersion::V6 => Self::Typed,
            BackendVersion::V7 => Self::Typeless,
        }
    }

    /// 액션 라인에 `_type`을 넣는지 여부
    pub fn sends_type(&self) -> bool {
        !matches!(self, Self::Typeless)
    }

    /// 아이템 에러 값에서 사람이 읽을 사유를 뽑습니다.
    pub fn item_reason(&self, error: &Value) -> String {
        match error {
            Value::String(s) => s.clone(),
            Value::Object(obj) if !matches!(self, Self::V1) || obj.contains_key("reason") => {
                let kind = obj.get("type").and_then(Value::as_str).unwrap_or("error");
                match obj.get("reason").and_then(Value::as_str) {
                    Some(reason) => format!("{kind}: {reason}"),
                    None => kind.to_owned(),
                }
            }
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct Action<'a> {
    index: ActionMeta<'a>,
}

#[derive(Serialize)]
struct ActionMeta<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_type", skip_serializing_if = "Option::is_none")]
    doc_type: Option<&'a str>,
    #[serde(rename = "_id")]
    id: &'a str,
}

/// 배치를 `_bulk` NDJSON 본문으로 인코딩합니다.
pub fn encode_bulk(batch: &Batch, dialect: Dialect) -> Result<Vec<u8>, serde_json::Error> {
    let capacity = batch.items.iter().map(|i| i.estimated_size()).sum();
    let mut body = Vec::with_capacity(capacity);
    for item in &batch.items {
        let action = Action {
            index: ActionMeta {
                index: &item.index,
                doc_type: dialect.sends_type().then_some(item.doc_type.as_str()),
                id: &item.id,
            },
        };
        serde_json::to_writer(&mut body, &action)?;
        body.push(b'\n');
        body.extend_from_slice(&item.body);
        body.push(b'\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    took: u64,
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<HashMap<String, BulkResponseItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkResponseItem {
    #[serde(rename = "_id", default)]
    id: String,
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    #[serde(default)]
    nodes: HashMap<String, NodeInfo>,
}

#[derive(Debug, Deserialize)]
struct NodeInfo {
    #[serde(default)]
    http: Option<NodeHttp>,
}

#[derive(Debug, Deserialize)]
struct NodeHttp {
    #[serde(default)]
    publish_address: String,
}

/// publish address를 `host:port`로 정규화합니다.
///
/// `inet[/10.0.0.1:9200]`, `node1/10.0.0.1:9200`, `10.0.0.1:9200` 형식을 받습니다.
pub fn parse_publish_address(addr: &str) -> Option<String> {
    let addr = addr.trim();
    let addr = addr
        .strip_prefix("inet[")
        .and_then(|a| a.strip_suffix(']'))
        .unwrap_or(addr);
    let host_port = addr.rsplit_once('/').map_or(addr, |(_, hp)| hp);
    let (host, port) = host_port.rsplit_once(':')?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return None;
    }
    Some(host_port.to_owned())
}

/// reqwest 기반 Elasticsearch 클라이언트
#[derive(Debug)]
pub struct ElasticsearchClient {
    http: reqwest::Client,
    nodes: Vec<Url>,
    next: AtomicUsize,
    dialect: Dialect,
    auth: Option<(String, String)>,
    stopped: AtomicBool,
}

impl ElasticsearchClient {
    /// 백엔드에 연결합니다.
    ///
    /// # Errors
    /// HTTP 클라이언트 생성 실패, `GET /` 실패 또는 비정상 응답
    pub async fn connect(opts: &LogOpts) -> Result<Self, LogPipelineError> {
        let conn_err = |reason: String| LogPipelineError::Connection {
            url: opts.url.clone(),
            reason,
        };

        let seed = Url::parse(&opts.url)
            .map(base_url)
            .map_err(|e| conn_err(e.to_string()))?;
        let http = reqwest::Client::builder()
            .connect_timeout(opts.timeout)
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(opts.insecure)
            .build()
            .map_err(|e| conn_err(e.to_string()))?;

        let mut client = Self {
            http,
            nodes: vec![seed.clone()],
            next: AtomicUsize::new(0),
            dialect: Dialect::for_version(opts.version),
            auth: (!opts.username.is_empty())
                .then(|| (opts.username.clone(), opts.password.clone())),
            stopped: AtomicBool::new(false),
        };

        let resp = client
            .request(Method::GET, seed.clone())
            .send()
            .await
            .map_err(|e| conn_err(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(conn_err(format!("ping returned {}", resp.status())));
        }

        if opts.sniff {
            match client.sniff(&seed).await {
                Ok(nodes) if !nodes.is_empty() => client.nodes = nodes,
                Ok(_) => warn!(url = %seed, "node discovery returned no http nodes, using seed url"),
                Err(e) => warn!(url = %seed, error = %e, "node discovery failed, using seed url"),
            }
        }

        info!(
            url = %seed,
            version = %opts.version,
            nodes = client.nodes.len(),
            "connected to elasticsearch"
        );
        Ok(client)
    }

    async fn sniff(&self, seed: &Url) -> Result<Vec<Url>, String> {
        let url = seed.join("_nodes/http").map_err(|e| e.to_string())?;
        let resp = self
            .request(Method::GET, url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("status {}", resp.status()));
        }
        let info: NodesResponse = resp.json().await.map_err(|e| e.to_string())?;

        let mut nodes: Vec<Url> = info
            .nodes
            .values()
            .filter_map(|n| n.http.as_ref())
            .filter_map(|h| parse_publish_address(&h.publish_address))
            .filter_map(|hp| Url::parse(&format!("{}://{hp}/", seed.scheme())).ok())
            .collect();
        nodes.sort();
        nodes.dedup();
        debug!(nodes = ?nodes.iter().map(Url::as_str).collect::<Vec<_>>(), "discovered nodes");
        Ok(nodes)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.auth {
            Some((user, pass)) => builder.basic_auth(user, Some(pass)),
            None => builder,
        }
    }

    fn next_node(&self) -> &Url {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.nodes.len();
        &self.nodes[idx]
    }

    /// 요청 대상 노드 목록
    pub fn nodes(&self) -> &[Url] {
        &self.nodes
    }

    /// 사용 중인 형식
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }
}

impl BulkClient for ElasticsearchClient {
    async fn commit(&self, batch: &Batch) -> Result<CommitResult, CommitError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CommitError::Fatal("client stopped".to_owned()));
        }

        let body = encode_bulk(batch, self.dialect).map_err(|e| CommitError::Fatal(e.to_string()))?;
        let url = self
            .next_node()
            .join("_bulk")
            .map_err(|e| CommitError::Fatal(e.to_string()))?;

        let resp = self
            .request(Method::POST, url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(CommitError::Transient(format!("bulk request returned {status}")));
        }
        if !status.is_success() {
            let mut reason = resp.text().await.unwrap_or_default();
            if reason.len() > MAX_REASON_LEN {
                let cut = (0..=MAX_REASON_LEN)
                    .rev()
                    .find(|i| reason.is_char_boundary(*i))
                    .unwrap_or(0);
                reason.truncate(cut);
            }
            return Err(CommitError::Rejected {
                status: status.as_u16(),
                reason,
            });
        }

        let parsed: BulkResponse = resp
            .json()
            .await
            .map_err(|e| CommitError::Transient(format!("unreadable bulk response: {e}")))?;

        let items = parsed
            .items
            .into_iter()
            .filter_map(|op| op.into_values().next())
            .map(|item| ItemStatus {
                reason: item.error.as_ref().map(|e| self.dialect.item_reason(e)),
                id: item.id,
                status: item.status,
            })
            .collect();

        Ok(CommitResult {
            took: Duration::from_millis(parsed.took),
            has_errors: parsed.errors,
            items,
        })
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        debug!(nodes = self.nodes.len(), "elasticsearch client stopped");
    }
}

fn classify(err: reqwest::Error) -> CommitError {
    if err.is_connect() {
        CommitError::Fatal(err.to_string())
    } else {
        CommitError::Transient(err.to_string())
    }
}

/// 로그 옵션으로 [`ElasticsearchClient`]를 만드는 팩토리
#[derive(Debug, Clone, Copy, Default)]
pub struct ElasticsearchFactory;

impl ClientFactory for ElasticsearchFactory {
    type Client = ElasticsearchClient;

    async fn connect(&self, opts: &LogOpts) -> Result<Self::Client, LogPipelineError> {
        ElasticsearchClient::connect(opts).await
    }
}

/// 경로가 `/`로 끝나도록 맞춥니다. `Url::join`이 마지막 경로 요소를 버리지 않게 합니다.
fn base_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

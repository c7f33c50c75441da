//! 스트림 설정 — 컨테이너별 로그 옵션과 데몬 공통 파이프라인 설정
//!
//! [`LogOpts`]는 `StartLogging` 요청의 `Config` 맵(`--log-opt key=value`)을
//! 검증하여 만든 스트림 단위 설정입니다. 알 수 없는 키는 즉시 에러입니다.
//!
//! [`PipelineConfig`]는 core의
//! [`PipelineDefaults`](eslog_core::config::PipelineDefaults)에서 파생되며,
//! 모든 스트림이 공유하는 채널 용량/재전송 정책을 담습니다.
//!
//! # 사용 예시
//! ```
//! use std::collections::HashMap;
//! use eslog_log_pipeline::config::LogOpts;
//!
//! let mut cfg = HashMap::new();
//! cfg.insert("elasticsearch-url".to_owned(), "http://127.0.0.1:9200".to_owned());
//! cfg.insert("elasticsearch-bulk-actions".to_owned(), "-1".to_owned());
//!
//! let opts = LogOpts::parse(&cfg).unwrap();
//! assert_eq!(opts.bulk.actions, None);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use eslog_core::config::PipelineDefaults;

use crate::error::LogPipelineError;
use crate::index;
use crate::record::MetadataField;

/// 기본 인덱스 템플릿
pub const DEFAULT_INDEX: &str = "docker-%Y.%m.%d";
/// 기본 문서 타입
pub const DEFAULT_DOC_TYPE: &str = "log";
/// 기본 메타데이터 필드 목록
pub const DEFAULT_FIELDS: &str = "containerID,containerName,containerImageName,containerCreated";
/// 기본 패턴 구분자
pub const DEFAULT_SPLITTER: &str = " and ";

/// 백엔드 메이저 버전
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendVersion {
    /// 1.x
    V1,
    /// 2.x
    V2,
    /// 5.x
    V5,
    /// 6.x
    V6,
    /// 7.x (typeless)
    V7,
}

impl BackendVersion {
    /// 메트릭 레이블용 문자열
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "1",
            Self::V2 => "2",
            Self::V5 => "5",
            Self::V6 => "6",
            Self::V7 => "7",
        }
    }
}

impl FromStr for BackendVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1" => Ok(Self::V1),
            "2" => Ok(Self::V2),
            "5" => Ok(Self::V5),
            "6" => Ok(Self::V6),
            "7" => Ok(Self::V7),
            other => Err(format!("version not supported: {other}")),
        }
    }
}

impl fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// bulk 커밋 임계값
#[derive(Debug, Clone, PartialEq)]
pub struct BulkOpts {
    /// 병렬 커밋 워커 수
    pub workers: usize,
    /// 액션 수 임계값 (`None`이면 비활성)
    pub actions: Option<usize>,
    /// 예상 바이트 크기 임계값 (`None`이면 비활성)
    pub size: Option<usize>,
    /// 주기적 플러시 간격
    pub flush_interval: Duration,
    /// 커밋마다 통계 로그 출력 여부
    pub stats: bool,
}

impl Default for BulkOpts {
    fn default() -> Self {
        Self {
            workers: 1,
            actions: Some(100),
            size: Some(5 << 20),
            flush_interval: Duration::from_secs(5),
            stats: false,
        }
    }
}

/// 라인 주석(grok) 옵션
#[derive(Debug, Clone, PartialEq)]
pub struct GrokOpts {
    /// 매칭 표현식 (비어 있으면 주석 비활성)
    pub match_expr: String,
    /// 인라인 패턴 정의 (`name=regex`를 splitter로 연결)
    pub pattern: String,
    /// 패턴 파일 또는 디렉토리 경로
    pub pattern_from: String,
    /// 인라인 패턴 구분자
    pub splitter: String,
    /// 이름 있는 캡처만 결과에 포함
    pub named_capture_only: bool,
}

impl GrokOpts {
    /// 주석이 설정되었는지 여부
    pub fn is_enabled(&self) -> bool {
        !self.match_expr.is_empty()
    }
}

impl Default for GrokOpts {
    fn default() -> Self {
        Self {
            match_expr: String::new(),
            pattern: String::new(),
            pattern_from: String::new(),
            splitter: DEFAULT_SPLITTER.to_owned(),
            named_capture_only: true,
        }
    }
}

/// 컨테이너별 로그 옵션
#[derive(Debug, Clone, PartialEq)]
pub struct LogOpts {
    /// 백엔드 URL (`http(s)://host:port`)
    pub url: String,
    /// 인덱스 이름 템플릿
    pub index: String,
    /// 문서 타입
    pub doc_type: String,
    /// basic auth 사용자 (비어 있으면 인증 없음)
    pub username: String,
    /// basic auth 비밀번호
    pub password: String,
    /// 재시도 상한 겸 연결 타임아웃
    pub timeout: Duration,
    /// 레코드에 포함할 메타데이터 필드
    pub fields: Vec<MetadataField>,
    /// 노드 탐색 여부
    pub sniff: bool,
    /// TLS 인증서 검증 생략
    pub insecure: bool,
    /// 백엔드 버전
    pub version: BackendVersion,
    /// bulk 설정
    pub bulk: BulkOpts,
    /// 주석 설정
    pub grok: GrokOpts,
}

impl Default for LogOpts {
    fn default() -> Self {
        Self {
            url: String::new(),
            index: DEFAULT_INDEX.to_owned(),
            doc_type: DEFAULT_DOC_TYPE.to_owned(),
            username: String::new(),
            password: String::new(),
            timeout: Duration::from_secs(1),
            // 기본 필드 문자열은 항상 유효함
            fields: parse_fields(DEFAULT_FIELDS).unwrap_or_default(),
            sniff: true,
            insecure: false,
            version: BackendVersion::V5,
            bulk: BulkOpts::default(),
            grok: GrokOpts::default(),
        }
    }
}

impl LogOpts {
    /// `--log-opt` 맵을 검증하여 옵션을 생성합니다.
    ///
    /// # Errors
    /// 알 수 없는 키, 형식 오류, 범위 밖의 값, `elasticsearch-url` 누락 시
    /// 해당 키를 담은 [`LogPipelineError::LogOpt`]를 반환합니다.
    pub fn parse(cfg: &HashMap<String, String>) -> Result<Self, LogPipelineError> {
        let mut opts = Self::default();

        // 에러 메시지가 결정적이도록 키 순서대로 검증
        let mut keys: Vec<&String> = cfg.keys().collect();
        keys.sort();

        for key in keys {
            let value = cfg[key].as_str();
            match key.as_str() {
                "elasticsearch-url" => {
                    parse_url(value).map_err(|r| opt_err(key, r))?;
                    opts.url = value.to_owned();
                }
                "elasticsearch-index" => {
                    index::validate_template(value).map_err(|r| opt_err(key, r))?;
                    opts.index = value.to_owned();
                }
                "elasticsearch-type" => opts.doc_type = value.to_owned(),
                "elasticsearch-username" => opts.username = value.to_owned(),
                "elasticsearch-password" => opts.password = value.to_owned(),
                "elasticsearch-timeout" => {
                    let secs = parse_positive(key, value)?;
                    opts.timeout = Duration::from_secs(secs as u64);
                }
                "elasticsearch-fields" => {
                    opts.fields = parse_fields(value).map_err(|r| opt_err(key, r))?;
                }
                "elasticsearch-sniff" => opts.sniff = parse_bool(key, value)?,
                "elasticsearch-insecure" => opts.insecure = parse_bool(key, value)?,
                "elasticsearch-version" => {
                    opts.version = value.parse().map_err(|r| opt_err(key, r))?;
                }
                "elasticsearch-bulk-workers" => opts.bulk.workers = parse_positive(key, value)?,
                "elasticsearch-bulk-actions" => opts.bulk.actions = parse_threshold(key, value)?,
                "elasticsearch-bulk-size" => opts.bulk.size = parse_threshold(key, value)?,
                "elasticsearch-bulk-flush-interval" => {
                    let interval = humantime::parse_duration(value)
                        .map_err(|e| opt_err(key, e.to_string()))?;
                    if interval.is_zero() {
                        return Err(opt_err(key, "must be greater than 0"));
                    }
                    opts.bulk.flush_interval = interval;
                }
                "elasticsearch-bulk-stats" => opts.bulk.stats = parse_bool(key, value)?,
                "grok-match" => opts.grok.match_expr = value.to_owned(),
                "grok-pattern" => opts.grok.pattern = value.to_owned(),
                "grok-pattern-from" => opts.grok.pattern_from = value.to_owned(),
                "grok-pattern-splitter" => {
                    if value.is_empty() {
                        return Err(opt_err(key, "must not be empty"));
                    }
                    opts.grok.splitter = value.to_owned();
                }
                "grok-named-capture" => opts.grok.named_capture_only = parse_bool(key, value)?,
                _ => return Err(opt_err(key, "unknown log-opt")),
            }
        }

        if opts.url.is_empty() {
            return Err(opt_err("elasticsearch-url", "required"));
        }

        Ok(opts)
    }
}

/// 데몬 공통 파이프라인 설정
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// 스테이지 간 채널 용량
    pub channel_capacity: usize,
    /// 재전송 전 대기 시간
    pub resend_delay: Duration,
    /// 재전송 대상 상태 코드
    pub retryable_statuses: Vec<u16>,
    /// 연속 디코드 에러 허용 횟수
    pub max_decode_retries: u32,
    /// 최대 프레임 크기 (바이트)
    pub max_frame_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_core(&PipelineDefaults::default())
    }
}

impl PipelineConfig {
    /// core 설정에서 파이프라인 설정을 생성합니다.
    pub fn from_core(core: &PipelineDefaults) -> Self {
        Self {
            channel_capacity: core.channel_capacity.max(1),
            resend_delay: Duration::from_millis(core.resend_delay_ms),
            retryable_statuses: core.retryable_statuses.clone(),
            max_decode_retries: core.max_decode_retries,
            max_frame_size: core.max_frame_size,
        }
    }
}

fn opt_err(key: &str, reason: impl Into<String>) -> LogPipelineError {
    LogPipelineError::LogOpt {
        key: key.to_owned(),
        reason: reason.into(),
    }
}

fn parse_url(address: &str) -> Result<(), String> {
    if address.is_empty() {
        return Err("must not be empty".to_owned());
    }
    let url = reqwest::Url::parse(address).map_err(|e| e.to_string())?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(format!(
            "endpoint accepts only http/https, but provided: {}",
            url.scheme()
        ));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err("missing host".to_owned());
    }

    // Url은 스킴 기본 포트를 생략하므로 원문에서 포트를 확인
    let authority = address
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(address)
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    let has_port = host_port
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if !has_port {
        return Err("please provide the url as proto://host:port".to_owned());
    }
    Ok(())
}

fn parse_fields(value: &str) -> Result<Vec<MetadataField>, String> {
    let mut fields = Vec::new();
    for name in value.split(',').map(str::trim) {
        match name {
            "none" | "null" | "" => {}
            other => fields.push(other.parse::<MetadataField>()?),
        }
    }
    fields.sort_unstable();
    fields.dedup();
    Ok(fields)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, LogPipelineError> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(opt_err(key, format!("invalid boolean: {other:?}"))),
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize, LogPipelineError> {
    let n: i64 = value.parse().map_err(|e: std::num::ParseIntError| opt_err(key, e.to_string()))?;
    if n < 1 {
        return Err(opt_err(key, "must be at least 1"));
    }
    usize::try_from(n).map_err(|e| opt_err(key, e.to_string()))
}

fn parse_threshold(key: &str, value: &str) -> Result<Option<usize>, LogPipelineError> {
    if value.trim() == "-1" {
        return Ok(None);
    }
    parse_positive(key, value)
        .map(Some)
        .map_err(|_| opt_err(key, "must be at least 1, or -1 to disable"))
}

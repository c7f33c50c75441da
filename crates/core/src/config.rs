//! 설정 관리 — eslog.toml 파싱 및 런타임 설정
//!
//! [`EslogConfig`]는 데몬 전체 설정을 담는 최상위 구조체입니다.
//! 컨테이너별 로그 옵션(`--log-opt`)은 여기에 포함되지 않으며,
//! `eslog-log-pipeline`의 `LogOpts`가 스트림 시작 시 별도로 검증합니다.
//!
//! # 설정 로딩 우선순위
//! 1. CLI 인자 (최고 우선)
//! 2. 환경변수 (`ESLOG_PIPELINE_CHANNEL_CAPACITY=4` 형식)
//! 3. 설정 파일 (`eslog.toml`)
//! 4. 기본값 (`Default` 구현)
//!
//! # 사용 예시
//! ```no_run
//! # async fn example() -> Result<(), eslog_core::error::EslogError> {
//! use eslog_core::config::EslogConfig;
//!
//! // 파일에서 로드 + 환경변수 오버라이드
//! let config = EslogConfig::load("eslog.toml").await?;
//!
//! // TOML 문자열에서 직접 파싱
//! let config = EslogConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, EslogError};

/// eslog 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EslogConfig {
    /// 일반 설정
    #[serde(default)]
    pub general: GeneralConfig,
    /// 플러그인 소켓 설정
    #[serde(default)]
    pub plugin: PluginConfig,
    /// 파이프라인 튜닝 설정 (모든 스트림 공통)
    #[serde(default)]
    pub pipeline: PipelineDefaults,
    /// 메트릭 익스포터 설정
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl EslogConfig {
    /// TOML 파일에서 설정을 로드하고 환경변수 오버라이드를 적용합니다.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, EslogError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// 설정 파일이 없으면 기본값으로 시작합니다.
    ///
    /// 파일이 존재하지만 파싱/검증에 실패하면 에러를 반환합니다.
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self, EslogError> {
        let path = path.as_ref();
        match Self::load(path).await {
            Err(EslogError::Config(ConfigError::FileNotFound { .. })) => {
                warn!(
                    path = %path.display(),
                    "config file not found, using defaults"
                );
                let mut config = Self::default();
                config.apply_env_overrides();
                config.validate()?;
                Ok(config)
            }
            other => other,
        }
    }

    /// TOML 파일에서 설정을 로드합니다 (환경변수 오버라이드 없음).
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, EslogError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EslogError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                EslogError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 문자열에서 설정을 파싱합니다.
    pub fn parse(toml_str: &str) -> Result<Self, EslogError> {
        toml::from_str(toml_str).map_err(|e| {
            EslogError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// 환경변수로 설정값을 오버라이드합니다.
    ///
    /// 환경변수 네이밍 규칙: `ESLOG_{SECTION}_{FIELD}`
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "ESLOG_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "ESLOG_GENERAL_LOG_FORMAT");

        // Plugin
        override_string(&mut self.plugin.socket_path, "ESLOG_PLUGIN_SOCKET_PATH");
        override_u64(
            &mut self.plugin.shutdown_timeout_secs,
            "ESLOG_PLUGIN_SHUTDOWN_TIMEOUT_SECS",
        );

        // Pipeline
        override_usize(
            &mut self.pipeline.channel_capacity,
            "ESLOG_PIPELINE_CHANNEL_CAPACITY",
        );
        override_u64(
            &mut self.pipeline.resend_delay_ms,
            "ESLOG_PIPELINE_RESEND_DELAY_MS",
        );
        override_u16_csv(
            &mut self.pipeline.retryable_statuses,
            "ESLOG_PIPELINE_RETRYABLE_STATUSES",
        );
        override_u32(
            &mut self.pipeline.max_decode_retries,
            "ESLOG_PIPELINE_MAX_DECODE_RETRIES",
        );
        override_usize(
            &mut self.pipeline.max_frame_size,
            "ESLOG_PIPELINE_MAX_FRAME_SIZE",
        );

        // Metrics
        override_bool(&mut self.metrics.enabled, "ESLOG_METRICS_ENABLED");
        override_string(&mut self.metrics.listen_addr, "ESLOG_METRICS_LISTEN_ADDR");
        override_u16(&mut self.metrics.port, "ESLOG_METRICS_PORT");
    }

    /// 설정값의 유효성을 검증합니다.
    pub fn validate(&self) -> Result<(), EslogError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(invalid(
                "general.log_level",
                format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(invalid(
                "general.log_format",
                format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        if self.plugin.socket_path.is_empty() {
            return Err(invalid("plugin.socket_path", "must not be empty"));
        }

        // tokio mpsc는 용량 0을 허용하지 않음
        if self.pipeline.channel_capacity == 0 {
            return Err(invalid("pipeline.channel_capacity", "must be at least 1"));
        }

        if self.pipeline.max_frame_size == 0 {
            return Err(invalid("pipeline.max_frame_size", "must be at least 1"));
        }

        if let Some(status) = self
            .pipeline
            .retryable_statuses
            .iter()
            .find(|s| !(100..=599).contains(*s))
        {
            return Err(invalid(
                "pipeline.retryable_statuses",
                format!("{status} is not an HTTP status code"),
            ));
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(invalid("metrics.port", "must not be 0 when metrics are enabled"));
        }

        Ok(())
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> EslogError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.into(),
    }
    .into()
}

/// 일반 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 로그 레벨 (trace, debug, info, warn, error)
    pub log_level: String,
    /// 로그 형식 (json, pretty)
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "json".to_owned(),
        }
    }
}

/// 호스트 플러그인 소켓 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// 플러그인 API unix socket 경로
    pub socket_path: String,
    /// 종료 시 스트림 드레인 최대 대기 시간 (초)
    pub shutdown_timeout_secs: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            socket_path: "/run/docker/plugins/elasticsearch.sock".to_owned(),
            shutdown_timeout_secs: 30,
        }
    }
}

/// 파이프라인 튜닝 설정
///
/// 컨테이너별 로그 옵션과 달리 데몬 전체에 한 번 적용됩니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineDefaults {
    /// 스테이지 간 채널 용량 (작을수록 백프레셔가 빨리 걸림)
    pub channel_capacity: usize,
    /// 재전송 대상 아이템을 다음 배치에 넣기 전 대기 시간 (밀리초)
    pub resend_delay_ms: u64,
    /// 재전송 대상 아이템 상태 코드
    pub retryable_statuses: Vec<u16>,
    /// 연속 디코드 에러 허용 횟수
    pub max_decode_retries: u32,
    /// 단일 프레임 최대 크기 (바이트)
    pub max_frame_size: usize,
}

impl Default for PipelineDefaults {
    fn default() -> Self {
        Self {
            channel_capacity: 1,
            resend_delay_ms: 3_000,
            retryable_statuses: vec![429],
            max_decode_retries: 5,
            max_frame_size: 1_000_000,
        }
    }
}

/// Prometheus 메트릭 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// 활성화 여부
    pub enabled: bool,
    /// 리스닝 주소
    pub listen_addr: String,
    /// 리스닝 포트
    pub port: u16,
    /// 스크레이프 엔드포인트 경로
    pub endpoint: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1".to_owned(),
            port: 9100,
            endpoint: "/metrics".to_owned(),
        }
    }
}

// --- 환경변수 오버라이드 헬퍼 ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    override_parsed(target, env_key, "bool");
}

fn override_u16(target: &mut u16, env_key: &str) {
    override_parsed(target, env_key, "u16");
}

fn override_u32(target: &mut u32, env_key: &str) {
    override_parsed(target, env_key, "u32");
}

fn override_u64(target: &mut u64, env_key: &str) {
    override_parsed(target, env_key, "u64");
}

fn override_usize(target: &mut usize, env_key: &str) {
    override_parsed(target, env_key, "usize");
}

fn override_parsed<T: std::str::FromStr>(target: &mut T, env_key: &str, type_name: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<T>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                expected = type_name,
                "failed to parse env var, ignoring"
            ),
        }
    }
}

fn override_u16_csv(target: &mut Vec<u16>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        let parsed: Result<Vec<u16>, _> = val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse::<u16>)
            .collect();
        match parsed {
            Ok(list) => *target = list,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse status list from env var, ignoring"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn default_config_has_sane_values() {
        let config = EslogConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.general.log_format, "json");
        assert_eq!(
            config.plugin.socket_path,
            "/run/docker/plugins/elasticsearch.sock"
        );
        assert_eq!(config.pipeline.channel_capacity, 1);
        assert_eq!(config.pipeline.resend_delay_ms, 3_000);
        assert_eq!(config.pipeline.retryable_statuses, vec![429]);
        assert_eq!(config.pipeline.max_frame_size, 1_000_000);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn default_config_passes_validation() {
        EslogConfig::default().validate().unwrap();
    }

    #[test]
    fn from_str_empty_toml_uses_defaults() {
        let config = EslogConfig::parse("").unwrap();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.pipeline.max_decode_retries, 5);
    }

    #[test]
    fn from_str_partial_toml_merges_with_defaults() {
        let toml = r#"
[general]
log_level = "debug"

[pipeline]
retryable_statuses = [429, 503]
"#;
        let config = EslogConfig::parse(toml).unwrap();
        assert_eq!(config.general.log_level, "debug");
        // log_format은 기본값 유지
        assert_eq!(config.general.log_format, "json");
        assert_eq!(config.pipeline.retryable_statuses, vec![429, 503]);
        assert_eq!(config.pipeline.channel_capacity, 1);
    }

    #[test]
    fn from_str_invalid_toml_returns_error() {
        let err = EslogConfig::parse("invalid = [[[toml").unwrap_err();
        assert!(matches!(
            err,
            EslogError::Config(ConfigError::ParseFailed { .. })
        ));
    }

    #[test]
    fn validate_rejects_invalid_log_level() {
        let mut config = EslogConfig::default();
        config.general.log_level = "verbose".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn validate_rejects_invalid_log_format() {
        let mut config = EslogConfig::default();
        config.general.log_format = "xml".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("log_format"));
    }

    #[test]
    fn validate_rejects_zero_channel_capacity() {
        let mut config = EslogConfig::default();
        config.pipeline.channel_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("channel_capacity"));
    }

    #[test]
    fn validate_rejects_non_http_retryable_status() {
        let mut config = EslogConfig::default();
        config.pipeline.retryable_statuses = vec![429, 42];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn validate_rejects_zero_metrics_port_only_when_enabled() {
        let mut config = EslogConfig::default();
        config.metrics.port = 0;
        config.validate().unwrap();

        config.metrics.enabled = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("metrics.port"));
    }

    #[test]
    #[serial]
    fn env_override_string() {
        let mut val = "original".to_owned();
        // SAFETY: serial 테스트에서만 환경변수를 조작합니다.
        unsafe { std::env::set_var("TEST_ESLOG_STR", "overridden") };
        override_string(&mut val, "TEST_ESLOG_STR");
        assert_eq!(val, "overridden");
        unsafe { std::env::remove_var("TEST_ESLOG_STR") };
    }

    #[test]
    #[serial]
    fn env_override_invalid_number_keeps_original() {
        let mut val = 7usize;
        // SAFETY: serial 테스트에서만 환경변수를 조작합니다.
        unsafe { std::env::set_var("TEST_ESLOG_USIZE_BAD", "seven") };
        override_usize(&mut val, "TEST_ESLOG_USIZE_BAD");
        assert_eq!(val, 7); // 원래 값 유지
        unsafe { std::env::remove_var("TEST_ESLOG_USIZE_BAD") };
    }

    #[test]
    #[serial]
    fn env_override_status_list() {
        let mut val = vec![429];
        // SAFETY: serial 테스트에서만 환경변수를 조작합니다.
        unsafe { std::env::set_var("TEST_ESLOG_STATUSES", "429, 503 ,502") };
        override_u16_csv(&mut val, "TEST_ESLOG_STATUSES");
        assert_eq!(val, vec![429, 503, 502]);

        unsafe { std::env::set_var("TEST_ESLOG_STATUSES", "429,abc") };
        override_u16_csv(&mut val, "TEST_ESLOG_STATUSES");
        assert_eq!(val, vec![429, 503, 502]);
        unsafe { std::env::remove_var("TEST_ESLOG_STATUSES") };
    }

    #[test]
    fn env_override_missing_var_keeps_original() {
        let mut val = "original".to_owned();
        override_string(&mut val, "TEST_ESLOG_NONEXISTENT_12345");
        assert_eq!(val, "original");
    }

    #[test]
    fn config_serialize_roundtrip() {
        let config = EslogConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed = EslogConfig::parse(&toml_str).unwrap();
        assert_eq!(config.plugin.socket_path, parsed.plugin.socket_path);
        assert_eq!(
            config.pipeline.retryable_statuses,
            parsed.pipeline.retryable_statuses
        );
    }

    #[tokio::test]
    async fn from_file_not_found() {
        let err = EslogConfig::from_file("/nonexistent/path/eslog.toml")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EslogError::Config(ConfigError::FileNotFound { .. })
        ));
    }

    #[tokio::test]
    #[serial]
    async fn load_or_default_falls_back_when_missing() {
        let config = EslogConfig::load_or_default("/nonexistent/path/eslog.toml")
            .await
            .unwrap();
        assert_eq!(config.general.log_level, "info");
    }
}

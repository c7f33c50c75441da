//! 로그 파이프라인 에러 타입
//!
//! [`LogPipelineError`]는 스트림 시작부터 bulk 커밋까지 파이프라인 내부에서
//! 발생하는 모든 에러를 표현합니다.
//! `From<LogPipelineError> for EslogError` 변환이 구현되어 있어
//! 상위 레이어에서 `?` 연산자로 자연스럽게 전파할 수 있습니다.

use eslog_core::error::{EslogError, PipelineError};

/// 로그 파이프라인 도메인 에러
#[derive(Debug, thiserror::Error)]
pub enum LogPipelineError {
    /// 로그 옵션 검증 실패
    #[error("invalid log option {key}: {reason}")]
    LogOpt {
        /// 옵션 키 (예: elasticsearch-url)
        key: String,
        /// 실패 사유
        reason: String,
    },

    /// 설정 에러
    #[error("config error: {field}: {reason}")]
    Config {
        /// 설정 필드명
        field: String,
        /// 에러 사유
        reason: String,
    },

    /// 주석 패턴 정의/컴파일 실패
    #[error("pattern error: {name}: {reason}")]
    Pattern {
        /// 패턴 이름 (또는 매칭 표현식)
        name: String,
        /// 실패 사유
        reason: String,
    },

    /// 패턴 파일 로딩 실패
    #[error("pattern load error: {path}: {reason}")]
    PatternLoad {
        /// 파일 또는 디렉토리 경로
        path: String,
        /// 실패 사유
        reason: String,
    },

    /// 라인이 패턴과 일치하지 않음 (레코드 단위, 복구 가능)
    #[error("pattern does not match line: {0}")]
    NoMatch(String),

    /// 프레임 디코드 실패
    #[error("decode error: {0}")]
    Decode(String),

    /// 백엔드 연결 실패
    #[error("backend connection failed: {url}: {reason}")]
    Connection {
        /// 백엔드 URL
        url: String,
        /// 실패 사유
        reason: String,
    },

    /// 같은 키로 이미 실행 중인 스트림
    #[error("a logger for stream {0} already exists")]
    StreamExists(String),

    /// 등록되지 않은 스트림
    #[error("logger not found for stream {0}")]
    StreamNotFound(String),

    /// 채널 통신 에러
    #[error("channel error: {0}")]
    Channel(String),

    /// 스테이지 태스크 실패 (panic 포함)
    #[error("stage {stage} failed: {reason}")]
    Stage {
        /// 스테이지 이름 (reader, annotator, bulk-N)
        stage: String,
        /// 실패 사유
        reason: String,
    },

    /// I/O 에러
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 문서 직렬화 에러
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<LogPipelineError> for EslogError {
    fn from(err: LogPipelineError) -> Self {
        match err {
            LogPipelineError::StreamExists(_) | LogPipelineError::StreamNotFound(_) => {
                EslogError::Pipeline(PipelineError::Registry(err.to_string()))
            }
            LogPipelineError::Stage { .. } => {
                EslogError::Pipeline(PipelineError::StageFailed(err.to_string()))
            }
            LogPipelineError::Io(e) => EslogError::Io(e),
            other => EslogError::Pipeline(PipelineError::InitFailed(other.to_string())),
        }
    }
}

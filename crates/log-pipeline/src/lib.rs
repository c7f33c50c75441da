#![doc = include_str!("../README.md")]
//!
//! # 모듈 구성
//!
//! - [`reader`]: length-prefixed 프레임 디코딩 ([`FrameReader`])
//! - [`annotate`]: 패턴 기반 라인 주석 ([`LineAnnotator`])
//! - [`record`]: 색인 문서와 컨테이너 메타데이터 선택
//! - [`index`]: 날짜 토큰 인덱스 이름 해석과 일 단위 갱신
//! - [`bulk`]: 배치 누적, 재시도 정책, 커밋 워커, Elasticsearch 백엔드
//! - [`pipeline`]: 스트림별 스테이지 감독 ([`PipelineSupervisor`])
//! - [`driver`]: 스트림 레지스트리 ([`LogDriver`])
//! - [`config`]: 로그 옵션 검증과 데몬 공통 파이프라인 설정
//! - [`stats`]: 스트림별 처리 카운터
//! - [`error`]: 도메인 에러 타입

pub mod annotate;
pub mod bulk;
pub mod config;
pub mod driver;
pub mod error;
pub mod index;
pub mod pipeline;
pub mod reader;
pub mod record;
pub mod stats;

// --- 주요 타입 re-export ---

// 레지스트리
pub use driver::{Capabilities, LogDriver, LoggingDriver};

// 파이프라인
pub use pipeline::{PipelineHandle, PipelineSupervisor, Stage};

// 스테이지
pub use annotate::{AnnotatorStage, LineAnnotator};
pub use reader::{FrameReader, LogEntry, RawFrame};

// 배치/커밋
pub use bulk::client::{BulkClient, ClientFactory, CommitError, CommitResult, ItemStatus};
pub use bulk::retry::{CommitOutcome, RetryPolicy};
pub use bulk::{Batch, BulkBatcher, BulkItem};

// 설정
pub use config::{LogOpts, PipelineConfig};

// 에러
pub use error::LogPipelineError;

// 통계
pub use stats::StatsSnapshot;

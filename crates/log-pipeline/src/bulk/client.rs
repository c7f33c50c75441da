//! 백엔드 제출 인터페이스
//!
//! [`BulkClient`]는 배치 하나를 제출하고 아이템별 결과를 돌려주는 능력만 표현합니다.
//! [`RetryPolicy`](super::retry::RetryPolicy)와 [`BulkWorker`](super::worker::BulkWorker)는
//! 이 trait에만 의존하므로, 테스트에서는 목 구현으로 교체합니다.
//!
//! [`ClientFactory`]는 스트림 시작 시 로그 옵션으로 클라이언트를 연결합니다.

use std::future::Future;
use std::time::Duration;

use crate::config::LogOpts;
use crate::error::LogPipelineError;

use super::Batch;

/// 아이템 하나의 처리 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemStatus {
    /// 문서 ID
    pub id: String,
    /// HTTP 상태 코드
    pub status: u16,
    /// 실패 사유 (성공이면 `None`)
    pub reason: Option<String>,
}

impl ItemStatus {
    /// 2xx 여부
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 전송에 성공한 커밋의 응답
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitResult {
    /// 백엔드 처리 시간
    pub took: Duration,
    /// 하나 이상의 아이템이 실패했는지
    pub has_errors: bool,
    /// 아이템별 결과
    pub items: Vec<ItemStatus>,
}

/// 전송 단계 실패
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    /// 재시도해도 소용없는 실패 (연결 거부 등)
    #[error("fatal transport error: {0}")]
    Fatal(String),
    /// 백오프 후 재시도할 실패 (타임아웃, 429, 5xx)
    #[error("transient transport error: {0}")]
    Transient(String),
    /// 요청 전체가 거부됨
    #[error("request rejected with status {status}: {reason}")]
    Rejected {
        /// HTTP 상태 코드
        status: u16,
        /// 응답 본문 요약
        reason: String,
    },
}

/// 배치 제출 능력
///
/// 여러 커밋 워커가 `Arc`로 공유하므로 `Send + Sync + 'static`입니다.
pub trait BulkClient: Send + Sync + 'static {
    /// 배치를 제출합니다.
    fn commit(&self, batch: &Batch)
    -> impl Future<Output = Result<CommitResult, CommitError>> + Send;

    /// 연결을 정리합니다. 이후 커밋은 실패합니다.
    fn stop(&self) -> impl Future<Output = ()> + Send;
}

/// 로그 옵션으로 클라이언트를 연결하는 팩토리
pub trait ClientFactory: Send + Sync + 'static {
    /// 생성되는 클라이언트 타입
    type Client: BulkClient;

    /// 백엔드에 연결합니다. 실패하면 스트림 시작이 중단됩니다.
    fn connect(
        &self,
        opts: &LogOpts,
    ) -> impl Future<Output = Result<Self::Client, LogPipelineError>> + Send;
}

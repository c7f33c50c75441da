//! 커밋 재시도 정책
//!
//! # 전송 실패
//! 100ms에서 시작해 두 배씩 늘어나는 지수 백오프로 다시 제출합니다.
//! 대기 시간은 `timeout`을 넘지 않고, [`MAX_RETRIES`]번 재시도 후 그 커밋 주기를
//! 포기합니다 (기본 1초: 100, 200, 400, 800, 1000ms). 연결 거부 같은 치명적 실패와
//! 요청 전체 거부는 즉시 포기합니다.
//!
//! # 아이템 실패
//! 전송은 성공했지만 일부 아이템이 실패하면, 재시도 대상 상태(기본 429)의
//! 아이템만 같은 ID로 다음 배치에 다시 넣습니다. 그 외 실패는 로그를 남기고 버립니다.

use std::collections::HashMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::client::{BulkClient, CommitError};
use super::{Batch, BulkItem};

/// 첫 백오프 대기 시간
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// 커밋 주기 하나의 최대 재시도 횟수
pub const MAX_RETRIES: u32 = 5;

/// 배치 하나의 커밋 결과
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// 모든 아이템 색인
    Committed {
        /// 색인된 아이템 수
        indexed: usize,
    },
    /// 일부 실패
    PartialFailure {
        /// 색인된 아이템 수
        indexed: usize,
        /// 다음 배치에 다시 넣을 아이템
        resend: Vec<BulkItem>,
        /// 버려진 아이템 수
        dropped: usize,
    },
    /// 전송 실패로 배치 전체를 버림
    Failed {
        /// 버려진 아이템 수
        dropped: usize,
    },
}

impl CommitOutcome {
    /// 메트릭 레이블
    pub fn label(&self) -> &'static str {
        match self {
            Self::Committed { .. } => "committed",
            Self::PartialFailure { .. } => "partial",
            Self::Failed { .. } => "failed",
        }
    }
}

/// 커밋 재시도 정책
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    timeout: Duration,
    retryable: Vec<u16>,
    resend_delay: Duration,
}

impl RetryPolicy {
    /// 정책을 만듭니다.
    pub fn new(timeout: Duration, retryable: Vec<u16>, resend_delay: Duration) -> Self {
        Self {
            timeout,
            retryable,
            resend_delay,
        }
    }

    /// 재시도 대상 상태인지 확인합니다.
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable.contains(&status)
    }

    /// `attempt`번째 실패 뒤의 대기 시간. 재시도 횟수를 다 쓰면 `None`입니다.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if attempt >= MAX_RETRIES {
            return None;
        }
        let delay = INITIAL_BACKOFF.saturating_mul(2u32.saturating_pow(attempt));
        Some(delay.min(self.timeout))
    }

    /// 배치를 제출하고 결과를 분류합니다.
    ///
    /// 대기 중 `cancel`이 발동하면 더 기다리지 않고 현재 상태로 반환합니다.
    /// 진행 중인 HTTP 호출은 중단하지 않습니다.
    pub async fn commit<C: BulkClient>(
        &self,
        client: &C,
        batch: Batch,
        cancel: &CancellationToken,
    ) -> CommitOutcome {
        let mut attempt = 0u32;
        let result = loop {
            match client.commit(&batch).await {
                Ok(result) => break result,
                Err(CommitError::Transient(reason)) => {
                    let Some(delay) = self.backoff(attempt) else {
                        return self.give_up(&batch, &reason);
                    };
                    attempt += 1;
                    warn!(
                        error = %reason,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "bulk commit failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return self.give_up(&batch, &reason),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return self.give_up(&batch, &e.to_string()),
            }
        };

        if !result.has_errors {
            return CommitOutcome::Committed {
                indexed: batch.len(),
            };
        }

        let statuses: HashMap<&str, _> = result
            .items
            .iter()
            .map(|item| (item.id.as_str(), item))
            .collect();

        let mut indexed = 0;
        let mut dropped = 0;
        let mut resend = Vec::new();
        for item in batch.items {
            match statuses.get(item.id.as_str()) {
                Some(status) if status.is_success() => indexed += 1,
                Some(status) if self.is_retryable(status.status) => {
                    warn!(
                        id = %item.id,
                        index = %item.index,
                        status = status.status,
                        reason = status.reason.as_deref().unwrap_or_default(),
                        "bulk item rejected, resending"
                    );
                    resend.push(item);
                }
                Some(status) => {
                    error!(
                        id = %item.id,
                        index = %item.index,
                        status = status.status,
                        reason = status.reason.as_deref().unwrap_or_default(),
                        "bulk item failed, dropping"
                    );
                    dropped += 1;
                }
                None => {
                    error!(id = %item.id, index = %item.index, "bulk item missing from response, dropping");
                    dropped += 1;
                }
            }
        }

        if !resend.is_empty() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.resend_delay) => {}
            }
        }

        CommitOutcome::PartialFailure {
            indexed,
            resend,
            dropped,
        }
    }

    fn give_up(&self, batch: &Batch, reason: &str) -> CommitOutcome {
        error!(
            items = batch.len(),
            error = %reason,
            "bulk commit failed, dropping batch"
        );
        CommitOutcome::Failed {
            dropped: batch.len(),
        }
    }
}

//! bulk 색인 — 레코드 배치 누적, 커밋 시점 결정, 재전송
//!
//! # 구성
//! - [`BulkBatcher`]: 워커 하나가 소유하는 배치. 액션 수/예상 크기 임계값 판단
//! - [`client::BulkClient`]: 백엔드 제출 인터페이스
//! - [`retry::RetryPolicy`]: 전송 실패 백오프와 아이템 단위 재전송 분류
//! - [`worker::BulkWorker`]: 채널 수신, 임계값/주기 플러시, 종료 시 최종 플러시
//! - [`elasticsearch`]: reqwest 기반 Elasticsearch 백엔드
//!
//! ```text
//! LogRecord -> BulkBatcher::add -> should_commit? -> drain -> RetryPolicy::commit
//!                    ^                                              |
//!                    +---------------- requeue(resend) -------------+
//! ```

pub mod client;
pub mod elasticsearch;
pub mod retry;
pub mod worker;

use std::collections::VecDeque;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::LogPipelineError;
use crate::record::LogRecord;

/// bulk 액션 라인 고정 오버헤드 (`{"index":{"_index":"","_type":"","_id":""}}\n` + 본문 개행)
const ACTION_OVERHEAD: usize = 48;

/// 제출 대기 중인 문서 하나
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    /// 재전송에도 유지되는 문서 ID
    pub id: String,
    /// 대상 인덱스
    pub index: String,
    /// 문서 타입
    pub doc_type: String,
    /// 직렬화된 JSON 문서
    pub body: Bytes,
}

impl BulkItem {
    /// 레코드를 직렬화하고 새 ID를 부여합니다.
    pub fn new(index: &str, doc_type: &str, record: &LogRecord) -> Result<Self, LogPipelineError> {
        let body = serde_json::to_vec(record)?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            index: index.to_owned(),
            doc_type: doc_type.to_owned(),
            body: Bytes::from(body),
        })
    }

    /// 요청 본문에서 차지할 예상 바이트 수
    pub fn estimated_size(&self) -> usize {
        ACTION_OVERHEAD + self.index.len() + self.doc_type.len() + self.id.len() + self.body.len()
    }
}

/// 한 번에 제출할 아이템 묶음 (순서 유지)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    /// 아이템 목록
    pub items: Vec<BulkItem>,
}

impl Batch {
    /// 아이템 수
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// 비어 있는지 여부
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// ID로 아이템을 찾습니다.
    pub fn get(&self, id: &str) -> Option<&BulkItem> {
        self.items.iter().find(|item| item.id == id)
    }
}

/// 워커 전용 배치 누적기
///
/// 단일 소유자만 `add`/`drain`을 호출합니다.
#[derive(Debug, Default)]
pub struct BulkBatcher {
    items: VecDeque<BulkItem>,
    estimated_bytes: usize,
}

impl BulkBatcher {
    /// 빈 배처를 만듭니다.
    pub fn new() -> Self {
        Self::default()
    }

    /// 레코드를 새 ID로 배치 끝에 추가합니다.
    pub fn add(
        &mut self,
        index: &str,
        doc_type: &str,
        record: &LogRecord,
    ) -> Result<(), LogPipelineError> {
        let item = BulkItem::new(index, doc_type, record)?;
        self.push(item);
        Ok(())
    }

    /// 이미 만들어진 아이템을 끝에 추가합니다.
    pub fn push(&mut self, item: BulkItem) {
        self.estimated_bytes += item.estimated_size();
        self.items.push_back(item);
    }

    /// 재전송 아이템을 원래 순서대로 배치 앞에 넣습니다.
    pub fn requeue(&mut self, resend: Vec<BulkItem>) {
        for item in resend.into_iter().rev() {
            self.estimated_bytes += item.estimated_size();
            self.items.push_front(item);
        }
    }

    /// 임계값 중 하나라도 도달했는지 판단합니다. `None`은 비활성입니다.
    pub fn should_commit(&self, actions: Option<usize>, size: Option<usize>) -> bool {
        if self.items.is_empty() {
            return false;
        }
        actions.is_some_and(|limit| self.items.len() >= limit)
            || size.is_some_and(|limit| self.estimated_bytes >= limit)
    }

    /// 누적된 아이템을 모두 꺼냅니다.
    pub fn drain(&mut self) -> Batch {
        self.estimated_bytes = 0;
        Batch {
            items: self.items.drain(..).collect(),
        }
    }

    /// 누적 아이템 수
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// 비어 있는지 여부
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 누적 예상 바이트
    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }
}

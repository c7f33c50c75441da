//! 메트릭 상수 및 설명 등록
//!
//! 모든 Prometheus 메트릭의 이름과 설명을 중앙에서 정의합니다.
//! 파이프라인 각 스테이지는 이 상수를 사용하여 `metrics::counter!()`,
//! `metrics::gauge!()`, `metrics::histogram!()` 매크로를 호출합니다.
//!
//! # 네이밍 컨벤션
//!
//! - 접두어: `eslog_`
//! - 스테이지명: `reader_`, `annotator_`, `bulk_`, `driver_`
//! - 접미어: `_total` (counter), `_seconds` (histogram/latency), 없음 (gauge)
//!
//! # 사용 예시
//!
//! ```ignore
//! use metrics::counter;
//!
//! counter!(eslog_core::metrics::READER_FRAMES_TOTAL).increment(1);
//! ```

// ─── 레이블 키 상수 ────────────────────────────────────────────────

/// 백엔드 버전 레이블 키 (1, 2, 5, 6, 7)
pub const LABEL_BACKEND_VERSION: &str = "backend_version";

/// 결과 레이블 키 (committed, partial, failed)
pub const LABEL_RESULT: &str = "result";

// ─── Driver 메트릭 ─────────────────────────────────────────────────

/// Driver: 활성 스트림 수 (gauge)
pub const DRIVER_ACTIVE_STREAMS: &str = "eslog_driver_active_streams";

/// Driver: 시작 실패 수 (counter)
pub const DRIVER_START_FAILURES_TOTAL: &str = "eslog_driver_start_failures_total";

// ─── Reader 메트릭 ─────────────────────────────────────────────────

/// Reader: 디코드된 프레임 수 (counter)
pub const READER_FRAMES_TOTAL: &str = "eslog_reader_frames_total";

/// Reader: 공백 라인으로 버려진 프레임 수 (counter)
pub const READER_FRAMES_SKIPPED_TOTAL: &str = "eslog_reader_frames_skipped_total";

/// Reader: 디코드 에러 수 (counter)
pub const READER_DECODE_ERRORS_TOTAL: &str = "eslog_reader_decode_errors_total";

// ─── Annotator 메트릭 ──────────────────────────────────────────────

/// Annotator: 패턴 불일치/실패 수 (counter)
pub const ANNOTATOR_FAILURES_TOTAL: &str = "eslog_annotator_failures_total";

// ─── Bulk 메트릭 ───────────────────────────────────────────────────

/// Bulk: 배치에 추가된 레코드 수 (counter)
pub const BULK_RECORDS_ENQUEUED_TOTAL: &str = "eslog_bulk_records_enqueued_total";

/// Bulk: 커밋 시도 수 (counter, label: result)
pub const BULK_COMMITS_TOTAL: &str = "eslog_bulk_commits_total";

/// Bulk: 색인 성공 아이템 수 (counter)
pub const BULK_ITEMS_INDEXED_TOTAL: &str = "eslog_bulk_items_indexed_total";

/// Bulk: 재전송 아이템 수 (counter)
pub const BULK_ITEMS_RESENT_TOTAL: &str = "eslog_bulk_items_resent_total";

/// Bulk: 버려진 아이템 수 (counter)
pub const BULK_ITEMS_DROPPED_TOTAL: &str = "eslog_bulk_items_dropped_total";

/// Bulk: 커밋 소요 시간 (histogram, 초)
pub const BULK_COMMIT_DURATION_SECONDS: &str = "eslog_bulk_commit_duration_seconds";

/// 전체 메트릭 이름 목록
pub const ALL_METRIC_NAMES: &[&str] = &[
    DRIVER_ACTIVE_STREAMS,
    DRIVER_START_FAILURES_TOTAL,
    READER_FRAMES_TOTAL,
    READER_FRAMES_SKIPPED_TOTAL,
    READER_DECODE_ERRORS_TOTAL,
    ANNOTATOR_FAILURES_TOTAL,
    BULK_RECORDS_ENQUEUED_TOTAL,
    BULK_COMMITS_TOTAL,
    BULK_ITEMS_INDEXED_TOTAL,
    BULK_ITEMS_RESENT_TOTAL,
    BULK_ITEMS_DROPPED_TOTAL,
    BULK_COMMIT_DURATION_SECONDS,
];

/// 커밋 지연 시간 히스토그램 버킷 (초)
pub const COMMIT_DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// 모든 메트릭의 설명을 등록합니다.
///
/// 글로벌 레코더 설치 직후 한 번 호출합니다.
/// 레코더가 없어도 패닉하지 않습니다.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_gauge!(DRIVER_ACTIVE_STREAMS, "Number of active container log streams");
    describe_counter!(
        DRIVER_START_FAILURES_TOTAL,
        "StartLogging calls rejected by validation or backend connection"
    );

    describe_counter!(READER_FRAMES_TOTAL, "Frames decoded from log streams");
    describe_counter!(
        READER_FRAMES_SKIPPED_TOTAL,
        "Frames dropped because the line was blank"
    );
    describe_counter!(READER_DECODE_ERRORS_TOTAL, "Frame decode errors");

    describe_counter!(
        ANNOTATOR_FAILURES_TOTAL,
        "Lines that did not match the configured pattern"
    );

    describe_counter!(BULK_RECORDS_ENQUEUED_TOTAL, "Records added to bulk batches");
    describe_counter!(BULK_COMMITS_TOTAL, "Bulk commit cycles by result");
    describe_counter!(BULK_ITEMS_INDEXED_TOTAL, "Documents acknowledged by the backend");
    describe_counter!(BULK_ITEMS_RESENT_TOTAL, "Documents resent after a retryable status");
    describe_counter!(BULK_ITEMS_DROPPED_TOTAL, "Documents dropped after a terminal failure");
    describe_histogram!(
        BULK_COMMIT_DURATION_SECONDS,
        metrics::Unit::Seconds,
        "Duration of a bulk commit including retries"
    );
}

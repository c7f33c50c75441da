//! 통합 테스트 -- 스트림 시작부터 bulk 커밋까지 전체 흐름 검증
//!
//! 백엔드는 스크립트된 응답을 돌려주는 [`RecordingClient`]로 대체하고,
//! FIFO 대신 `tokio::io::duplex`에 와이어 프레임을 씁니다.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use tokio::io::{AsyncWriteExt, DuplexStream};

use eslog_core::types::ContainerInfo;
use eslog_log_pipeline::reader::encode_frame;
use eslog_log_pipeline::{
    Batch, BulkClient, ClientFactory, CommitError, CommitResult, ItemStatus, LineAnnotator,
    LogDriver, LogEntry, LogOpts, LogPipelineError, PipelineConfig, PipelineSupervisor,
};
use eslog_log_pipeline::record::ContainerMetadata;

/// 백엔드 호출 기록
#[derive(Debug, Clone, PartialEq)]
enum Call {
    Commit(Vec<String>),
    Stop,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<Call>>,
    batches: Mutex<Vec<Batch>>,
    statuses: Mutex<VecDeque<Vec<u16>>>,
}

/// 호출을 기록하고 스크립트된 아이템 상태를 돌려주는 클라이언트
#[derive(Clone, Default)]
struct RecordingClient {
    shared: Arc<Shared>,
}

impl RecordingClient {
    fn with_statuses(statuses: Vec<Vec<u16>>) -> Self {
        let client = Self::default();
        *client.shared.statuses.lock().unwrap() = statuses.into();
        client
    }

    fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().unwrap().clone()
    }

    fn batches(&self) -> Vec<Batch> {
        self.shared.batches.lock().unwrap().clone()
    }

    fn messages(&self) -> Vec<String> {
        self.batches()
            .iter()
            .flat_map(|b| b.items.iter())
            .map(|item| {
                let doc: serde_json::Value = serde_json::from_slice(&item.body).unwrap();
                doc["message"].as_str().unwrap_or_default().to_owned()
            })
            .collect()
    }
}

impl BulkClient for RecordingClient {
    async fn commit(&self, batch: &Batch) -> Result<CommitResult, CommitError> {
        let ids: Vec<String> = batch.items.iter().map(|i| i.id.clone()).collect();
        self.shared.calls.lock().unwrap().push(Call::Commit(ids));
        self.shared.batches.lock().unwrap().push(batch.clone());

        let statuses = self.shared.statuses.lock().unwrap().pop_front().unwrap_or_default();
        let items: Vec<ItemStatus> = batch
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let status = statuses.get(i).copied().unwrap_or(201);
                ItemStatus {
                    id: item.id.clone(),
                    status,
                    reason: (status >= 300).then(|| "rejected".to_owned()),
                }
            })
            .collect();
        Ok(CommitResult {
            took: Duration::from_millis(1),
            has_errors: items.iter().any(|i| !i.is_success()),
            items,
        })
    }

    async fn stop(&self) {
        self.shared.calls.lock().unwrap().push(Call::Stop);
    }
}

/// 미리 만든 클라이언트를 돌려주는 팩토리
struct SharedFactory(RecordingClient);

impl ClientFactory for SharedFactory {
    type Client = RecordingClient;

    async fn connect(&self, _opts: &LogOpts) -> Result<RecordingClient, LogPipelineError> {
        Ok(self.0.clone())
    }
}

fn log_opts(actions: Option<usize>) -> LogOpts {
    let mut opts = LogOpts {
        url: "http://127.0.0.1:9200".to_owned(),
        index: "docker".to_owned(),
        ..LogOpts::default()
    };
    opts.bulk.actions = actions;
    opts.bulk.size = None;
    opts.bulk.flush_interval = Duration::from_secs(3600);
    opts
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        resend_delay: Duration::from_millis(5),
        ..PipelineConfig::default()
    }
}

fn container_info(opts: &[(&str, &str)]) -> ContainerInfo {
    let mut config: HashMap<String, String> = opts
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    config
        .entry("elasticsearch-url".to_owned())
        .or_insert_with(|| "http://127.0.0.1:9200".to_owned());
    ContainerInfo {
        config,
        container_id: "0123456789abcdef0123".to_owned(),
        container_name: "/web".to_owned(),
        container_image_name: "nginx:1.25".to_owned(),
        ..ContainerInfo::default()
    }
}

async fn write_lines(writer: &mut DuplexStream, lines: &[String]) {
    for line in lines {
        let frame = encode_frame(&LogEntry {
            source: "stdout".to_owned(),
            time_nano: 1_525_392_000_000_000_000,
            line: Bytes::copy_from_slice(line.as_bytes()),
            partial: false,
        })
        .unwrap();
        writer.write_all(&frame).await.unwrap();
    }
    writer.flush().await.unwrap();
}

fn numbered(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("line {i}")).collect()
}

/// 150개 레코드, 액션 임계값 100 -> 100개, 50개 두 번 커밋
#[tokio::test]
async fn test_action_limit_splits_commits() {
    // 1. 파이프라인 시작
    let client = RecordingClient::default();
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    let handle = PipelineSupervisor::new(
        "s1",
        fast_config(),
        log_opts(Some(100)),
        LineAnnotator::passthrough(),
        ContainerMetadata::default(),
        client.clone(),
    )
    .spawn(reader);

    // 2. 150줄을 쓰고 작성자를 닫음
    write_lines(&mut writer, &numbered(150)).await;
    drop(writer);

    // 3. EOF 이후 드레인
    handle.stop().await;

    // 4. 검증
    let sizes: Vec<usize> = client.batches().iter().map(|b| b.len()).collect();
    assert_eq!(sizes, vec![100, 50]);
    assert_eq!(client.messages(), numbered(150));
}

/// 429 한 건은 같은 ID로 다음 배치에 한 번만 다시 나타남
#[tokio::test]
async fn test_retryable_item_resent_once_with_same_id() {
    let mut first = vec![201u16; 10];
    first[4] = 429;
    let client = RecordingClient::with_statuses(vec![first]);
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    let handle = PipelineSupervisor::new(
        "s2",
        fast_config(),
        log_opts(Some(10)),
        LineAnnotator::passthrough(),
        ContainerMetadata::default(),
        client.clone(),
    )
    .spawn(reader);

    write_lines(&mut writer, &numbered(10)).await;
    drop(writer);
    handle.stop().await;

    let batches = client.batches();
    assert_eq!(batches.len(), 2);
    let rejected = batches[0].items[4].id.clone();
    assert_eq!(batches[1].len(), 1);
    assert_eq!(batches[1].items[0].id, rejected);

    // 나머지 9건은 다시 나타나지 않음
    let resent_ids: Vec<&str> = batches[1..]
        .iter()
        .flat_map(|b| b.items.iter().map(|i| i.id.as_str()))
        .collect();
    for (i, item) in batches[0].items.iter().enumerate() {
        if i != 4 {
            assert!(!resent_ids.contains(&item.id.as_str()));
        }
    }
    let stats = handle.stats();
    assert_eq!(stats.resent, 1);
    assert_eq!(stats.indexed, 10);
}

/// 종결 상태(400) 아이템은 버려지고 다시 나타나지 않음
#[tokio::test]
async fn test_terminal_item_is_dropped() {
    let client = RecordingClient::with_statuses(vec![vec![400, 201, 201]]);
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    let handle = PipelineSupervisor::new(
        "s3",
        fast_config(),
        log_opts(Some(3)),
        LineAnnotator::passthrough(),
        ContainerMetadata::default(),
        client.clone(),
    )
    .spawn(reader);

    write_lines(&mut writer, &numbered(3)).await;
    drop(writer);
    handle.stop().await;

    assert_eq!(client.batches().len(), 1);
    let stats = handle.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.indexed, 2);
}

/// 정상 종료 시 버퍼에 남은 레코드를 클라이언트 정리 전에 플러시
#[tokio::test]
async fn test_stop_flushes_before_client_stop() {
    let client = RecordingClient::default();
    let driver = LogDriver::new(SharedFactory(client.clone()), fast_config());
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);

    driver
        .start_with_stream("/run/docker/logging/abc", &container_info(&[]), reader)
        .await
        .unwrap();
    write_lines(&mut writer, &numbered(5)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 작성자는 열린 채로 두고 StopLogging
    driver.stop_logging("/run/docker/logging/abc").await.unwrap();

    let calls = client.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(&calls[0], Call::Commit(ids) if ids.len() == 5));
    assert_eq!(calls[1], Call::Stop);
    assert!(driver.active_streams().is_empty());
}

/// 아무 프레임 없이 멈춰도 커밋 없이 깔끔하게 종료
#[tokio::test]
async fn test_stop_with_nothing_buffered() {
    let client = RecordingClient::default();
    let driver = LogDriver::new(SharedFactory(client.clone()), fast_config());
    let (_writer, reader) = tokio::io::duplex(1024);

    driver
        .start_with_stream("idle", &container_info(&[]), reader)
        .await
        .unwrap();
    driver.stop_logging("idle").await.unwrap();

    assert_eq!(client.calls(), vec![Call::Stop]);
}

/// 같은 스트림 키로 두 번 시작하면 두 번째가 실패
#[tokio::test]
async fn test_duplicate_stream_rejected() {
    let driver = LogDriver::new(SharedFactory(RecordingClient::default()), fast_config());
    let (_w1, r1) = tokio::io::duplex(1024);
    let (_w2, r2) = tokio::io::duplex(1024);

    driver
        .start_with_stream("/a/abc", &container_info(&[]), r1)
        .await
        .unwrap();
    let err = driver
        .start_with_stream("/b/abc", &container_info(&[]), r2)
        .await
        .unwrap_err();
    assert!(matches!(err, LogPipelineError::StreamExists(_)));

    driver.stop_all().await;
}

/// 메타데이터와 패턴 주석이 문서에 실림
#[tokio::test]
async fn test_documents_carry_metadata_and_annotation() {
    let client = RecordingClient::default();
    let driver = LogDriver::new(SharedFactory(client.clone()), fast_config());
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    let info = container_info(&[
        ("grok-match", "%{WORD:verb} %{NUMBER:code}"),
        ("elasticsearch-fields", "containerID,containerName,containerImageName"),
    ]);

    driver.start_with_stream("meta", &info, reader).await.unwrap();
    write_lines(&mut writer, &["GET 200".to_owned(), "???".to_owned()]).await;
    drop(writer);
    driver.stop_logging("meta").await.unwrap();

    let docs: Vec<serde_json::Value> = client
        .batches()
        .iter()
        .flat_map(|b| b.items.iter())
        .map(|i| serde_json::from_slice(&i.body).unwrap())
        .collect();
    assert_eq!(docs.len(), 2);

    assert_eq!(docs[0]["containerID"], "0123456789abcdef0123");
    assert_eq!(docs[0]["containerName"], "web");
    assert_eq!(docs[0]["containerImageName"], "nginx:1.25");
    assert_eq!(docs[0]["grok"]["verb"], "GET");
    assert_eq!(docs[0]["grok"]["code"], "200");
    assert!(docs[0].get("message").is_none());
    assert_eq!(docs[0]["source"], "stdout");
    assert_eq!(docs[0]["timestamp"], "2018-05-04T00:00:00Z");

    // 불일치 라인도 진단 주석과 함께 전달
    assert_eq!(docs[1]["grok"]["line"], "???");
    assert_eq!(docs[1]["grok"]["err"], "pattern does not match");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// 출력 순서 = 입력 순서 - 공백 라인
    #[test]
    fn test_order_preserved_and_blank_lines_filtered(
        lines in proptest::collection::vec(
            prop_oneof![
                3 => "[a-z0-9]{1,12}",
                1 => "[ \t\u{0b}\u{a0}\u{2003}\u{3000}]{0,3}",
            ],
            0..80,
        ),
        actions in proptest::option::of(1usize..20),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let messages = runtime.block_on(async {
            let client = RecordingClient::default();
            let (mut writer, reader) = tokio::io::duplex(64 * 1024);
            let handle = PipelineSupervisor::new(
                "prop",
                fast_config(),
                log_opts(actions),
                LineAnnotator::passthrough(),
                ContainerMetadata::default(),
                client.clone(),
            )
            .spawn(reader);
            write_lines(&mut writer, &lines).await;
            drop(writer);
            handle.stop().await;
            client.messages()
        });

        let expected: Vec<String> = lines
            .iter()
            .filter(|l| !l.trim().is_empty())
            .cloned()
            .collect();
        prop_assert_eq!(messages, expected);
    }
}

//! 색인 문서 — 프레임 + 컨테이너 메타데이터 + 주석
//!
//! [`LogRecord`]는 bulk 요청에 실리는 JSON 문서 하나입니다.
//! 메타데이터는 스트림 시작 시 한 번 만들어 [`Arc`]로 모든 레코드가 공유합니다.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

use eslog_core::types::ContainerInfo;

use crate::reader::RawFrame;

/// 레코드에 선택적으로 포함되는 컨테이너 메타데이터 필드
///
/// 선언 순서가 문서 내 직렬화 순서입니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetadataField {
    /// `config`
    Config,
    /// `containerID`
    ContainerId,
    /// `containerName`
    ContainerName,
    /// `containerEntrypoint`
    ContainerEntrypoint,
    /// `containerArgs`
    ContainerArgs,
    /// `containerImageID`
    ContainerImageId,
    /// `containerImageName`
    ContainerImageName,
    /// `containerCreated`
    ContainerCreated,
    /// `containerEnv`
    ContainerEnv,
    /// `containerLabels`
    ContainerLabels,
    /// `daemonName`
    DaemonName,
}

impl FromStr for MetadataField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "config" => Self::Config,
            "containerID" => Self::ContainerId,
            "containerName" => Self::ContainerName,
            "containerEntrypoint" => Self::ContainerEntrypoint,
            "containerArgs" => Self::ContainerArgs,
            "containerImageID" => Self::ContainerImageId,
            "containerImageName" => Self::ContainerImageName,
            "containerCreated" => Self::ContainerCreated,
            "containerEnv" => Self::ContainerEnv,
            "containerLabels" => Self::ContainerLabels,
            "daemonName" => Self::DaemonName,
            other => return Err(format!("invalid field: {other}")),
        })
    }
}

/// 선택된 컨테이너 메타데이터
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<HashMap<String, String>>,
    #[serde(rename = "containerID", skip_serializing_if = "Option::is_none")]
    container_id: Option<String>,
    #[serde(rename = "containerName", skip_serializing_if = "Option::is_none")]
    container_name: Option<String>,
    #[serde(rename = "containerEntrypoint", skip_serializing_if = "Option::is_none")]
    container_entrypoint: Option<String>,
    #[serde(rename = "containerArgs", skip_serializing_if = "Option::is_none")]
    container_args: Option<Vec<String>>,
    #[serde(rename = "containerImageID", skip_serializing_if = "Option::is_none")]
    container_image_id: Option<String>,
    #[serde(rename = "containerImageName", skip_serializing_if = "Option::is_none")]
    container_image_name: Option<String>,
    #[serde(
        rename = "containerCreated",
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_time"
    )]
    container_created: Option<DateTime<Utc>>,
    #[serde(rename = "containerEnv", skip_serializing_if = "Option::is_none")]
    container_env: Option<Vec<String>>,
    #[serde(rename = "containerLabels", skip_serializing_if = "Option::is_none")]
    container_labels: Option<HashMap<String, String>>,
    #[serde(rename = "daemonName", skip_serializing_if = "Option::is_none")]
    daemon_name: Option<String>,
}

impl ContainerMetadata {
    /// `fields`에 해당하는 값만 골라 메타데이터를 만듭니다. 빈 값은 생략됩니다.
    pub fn select(fields: &[MetadataField], info: &ContainerInfo) -> Self {
        let mut meta = Self::default();
        for field in fields {
            match field {
                MetadataField::Config => meta.config = non_empty_map(&info.config),
                MetadataField::ContainerId => meta.container_id = non_empty(info.id()),
                MetadataField::ContainerName => meta.container_name = non_empty(info.name()),
                MetadataField::ContainerEntrypoint => {
                    meta.container_entrypoint = non_empty(&info.container_entrypoint)
                }
                MetadataField::ContainerArgs => {
                    meta.container_args = non_empty_vec(&info.container_args)
                }
                MetadataField::ContainerImageId => {
                    meta.container_image_id = non_empty(&info.container_image_id)
                }
                MetadataField::ContainerImageName => {
                    meta.container_image_name = non_empty(&info.container_image_name)
                }
                MetadataField::ContainerCreated => meta.container_created = info.container_created,
                MetadataField::ContainerEnv => meta.container_env = non_empty_vec(&info.container_env),
                MetadataField::ContainerLabels => {
                    meta.container_labels = non_empty_map(&info.container_labels)
                }
                MetadataField::DaemonName => meta.daemon_name = non_empty(&info.daemon_name),
            }
        }
        meta
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_owned())
}

fn non_empty_vec(v: &[String]) -> Option<Vec<String>> {
    (!v.is_empty()).then(|| v.to_vec())
}

fn non_empty_map(m: &HashMap<String, String>) -> Option<HashMap<String, String>> {
    (!m.is_empty()).then(|| m.clone())
}

/// 색인 대상 문서
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    /// 공유 메타데이터
    #[serde(flatten)]
    pub metadata: Arc<ContainerMetadata>,
    /// 원본 라인 (주석이 설정되면 생략)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// `stdout` 또는 `stderr`
    pub source: String,
    /// 로그 발생 시각
    #[serde(serialize_with = "serialize_time")]
    pub timestamp: DateTime<Utc>,
    /// 부분 라인 여부
    pub partial: bool,
    /// 패턴 추출 결과 또는 진단 정보
    #[serde(rename = "grok", skip_serializing_if = "Option::is_none")]
    pub annotation: Option<BTreeMap<String, String>>,
}

impl LogRecord {
    /// 프레임과 주석 결과로 레코드를 만듭니다.
    pub fn new(
        metadata: Arc<ContainerMetadata>,
        frame: &RawFrame,
        message: Option<String>,
        annotation: Option<BTreeMap<String, String>>,
    ) -> Self {
        Self {
            metadata,
            message,
            source: frame.source.clone(),
            timestamp: DateTime::from_timestamp_nanos(frame.timestamp_nanos),
            partial: frame.partial,
            annotation,
        }
    }
}

fn serialize_time<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn serialize_opt_time<S: Serializer>(t: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
    match t {
        Some(t) => serialize_time(t, s),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn info() -> ContainerInfo {
        ContainerInfo {
            container_id: "8d3b8f6f1c7a".to_owned(),
            container_name: "/webapper".to_owned(),
            container_image_name: "nginx:alpine".to_owned(),
            container_created: Some(Utc.with_ymd_and_hms(2018, 5, 4, 10, 11, 12).unwrap()),
            daemon_name: "docker".to_owned(),
            ..Default::default()
        }
    }

    fn frame(line: &str) -> RawFrame {
        RawFrame {
            line: Bytes::copy_from_slice(line.as_bytes()),
            source: "stdout".to_owned(),
            timestamp_nanos: 1_525_428_672_123_456_789,
            partial: false,
        }
    }

    #[test]
    fn field_names_parse() {
        assert_eq!("containerID".parse(), Ok(MetadataField::ContainerId));
        assert_eq!("daemonName".parse(), Ok(MetadataField::DaemonName));
        assert!("logPath".parse::<MetadataField>().is_err());
    }

    #[test]
    fn selected_fields_only() {
        let meta = ContainerMetadata::select(
            &[MetadataField::ContainerId, MetadataField::ContainerName],
            &info(),
        );
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["containerID"], "8d3b8f6f1c7a");
        assert_eq!(json["containerName"], "webapper");
        assert!(json.get("containerImageName").is_none());
        assert!(json.get("daemonName").is_none());
    }

    #[test]
    fn empty_values_are_omitted() {
        let meta = ContainerMetadata::select(
            &[
                MetadataField::Config,
                MetadataField::ContainerArgs,
                MetadataField::ContainerEntrypoint,
                MetadataField::ContainerLabels,
            ],
            &info(),
        );
        assert_eq!(serde_json::to_string(&meta).unwrap(), "{}");
    }

    #[test]
    fn record_document_shape() {
        let meta = Arc::new(ContainerMetadata::select(
            &[MetadataField::ContainerId, MetadataField::ContainerCreated],
            &info(),
        ));
        let record = LogRecord::new(meta, &frame("hello"), Some("hello".to_owned()), None);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["containerID"], "8d3b8f6f1c7a");
        assert_eq!(json["containerCreated"], "2018-05-04T10:11:12Z");
        assert_eq!(json["message"], "hello");
        assert_eq!(json["source"], "stdout");
        assert_eq!(json["timestamp"], "2018-05-04T10:11:12.123456789Z");
        assert_eq!(json["partial"], false);
        assert!(json.get("grok").is_none());
    }

    #[test]
    fn annotated_record_has_grok_and_no_message() {
        let mut captures = BTreeMap::new();
        captures.insert("verb".to_owned(), "GET".to_owned());
        let record = LogRecord::new(
            Arc::new(ContainerMetadata::default()),
            &frame("GET /"),
            None,
            Some(captures),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("message").is_none());
        assert_eq!(json["grok"]["verb"], "GET");
    }
}

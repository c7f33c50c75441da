//! 도메인 타입 — 호스트 플러그인 프로토콜에서 공유하는 타입
//!
//! [`ContainerInfo`]는 호스트가 `StartLogging` 요청에 실어 보내는
//! 컨테이너 메타데이터입니다. 키는 호스트 쪽 표기(PascalCase)를 그대로 따릅니다.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// 컨테이너 메타데이터
///
/// `Config`에는 컨테이너에 지정된 `--log-opt` 키/값이 들어 있습니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInfo {
    /// 로그 옵션 (free-form key/value)
    #[serde(default, deserialize_with = "null_as_default")]
    pub config: HashMap<String, String>,
    /// 컨테이너 ID
    #[serde(rename = "ContainerID", default)]
    pub container_id: String,
    /// 컨테이너 이름 (호스트는 앞에 `/`를 붙여 보냄)
    #[serde(default)]
    pub container_name: String,
    /// 엔트리포인트
    #[serde(default)]
    pub container_entrypoint: String,
    /// 실행 인자
    #[serde(default, deserialize_with = "null_as_default")]
    pub container_args: Vec<String>,
    /// 이미지 ID
    #[serde(rename = "ContainerImageID", default)]
    pub container_image_id: String,
    /// 이미지 이름
    #[serde(default)]
    pub container_image_name: String,
    /// 생성 시각 (zero time은 None)
    #[serde(default, deserialize_with = "zero_time_as_none")]
    pub container_created: Option<DateTime<Utc>>,
    /// 환경변수 (`KEY=VALUE`)
    #[serde(default, deserialize_with = "null_as_default")]
    pub container_env: Vec<String>,
    /// 라벨
    #[serde(default, deserialize_with = "null_as_default")]
    pub container_labels: HashMap<String, String>,
    /// 호스트 쪽 로그 파일 경로
    #[serde(default)]
    pub log_path: String,
    /// 데몬 이름
    #[serde(default)]
    pub daemon_name: String,
}

impl ContainerInfo {
    /// 컨테이너 ID를 반환합니다.
    pub fn id(&self) -> &str {
        &self.container_id
    }

    /// 앞의 `/`를 제거한 컨테이너 이름을 반환합니다.
    pub fn name(&self) -> &str {
        self.container_name.trim_start_matches('/')
    }

    /// 로그 분석/표시용 12자리 짧은 ID
    pub fn short_id(&self) -> &str {
        self.container_id.get(..12).unwrap_or(&self.container_id)
    }
}

impl fmt::Display for ContainerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) image={}",
            self.name(),
            self.short_id(),
            self.container_image_name,
        )
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// 호스트는 생성 시각이 없을 때 "0001-01-01T00:00:00Z"를 보냄
fn zero_time_as_none<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let created = Option::<DateTime<Utc>>::deserialize(deserializer)?;
    Ok(created.filter(|t| t.year() > 1))
}

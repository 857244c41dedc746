//! Channel sources. The watcher is generic over [`ChannelSource`] so the
//! OS-specific event-log subscription stays behind one seam; the in-tree
//! [`JsonlFileSource`] tails newline-delimited JSON exports, which is what
//! development and the test suite run against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use once_cell::sync::Lazy;
use regex::Regex;
use sentinel_core::config::ChannelConfig;
use sentinel_core::error::{Error, ErrorCode, Result};
use sentinel_core::types::RawRecord;
use serde::Deserialize;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// A live subscription to one channel.
#[async_trait]
pub trait ChannelSource: Send + Sync + 'static {
    /// Open a record stream for `channel`, starting strictly after
    /// `from_token` (the persisted bookmark). Fails with
    /// `ChannelUnavailable` (retryable), `ChannelPermissionDenied` (fatal
    /// for the channel) or `InvalidFilter` (fatal for the channel).
    async fn subscribe(
        &self,
        channel: &ChannelConfig,
        from_token: Option<u64>,
    ) -> Result<BoxStream<'static, Result<RawRecord>>>;
}

static EVENT_ID_IN_FILTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"EventID\s*=\s*(\d+)").expect("static regex"));

/// Parsed form of an XPath channel filter.
///
/// Only the event-id selection subset is interpreted
/// (`*[System[(EventID=4625 or EventID=4625)]]` style); the full expression
/// is still validated for balance so a broken filter fails the channel at
/// startup instead of silently matching nothing.
#[derive(Debug, Clone, Default)]
pub struct ChannelFilter {
    event_ids: Option<HashSet<u32>>,
}

impl ChannelFilter {
    pub fn parse(filter: Option<&str>) -> Result<Self> {
        let Some(filter) = filter else {
            return Ok(Self::default());
        };
        let filter = filter.trim();
        if filter.is_empty() {
            return Ok(Self::default());
        }

        let mut depth = 0i32;
        for ch in filter.chars() {
            match ch {
                '[' => depth += 1,
                ']' => depth -= 1,
                _ => {}
            }
            if depth < 0 {
                break;
            }
        }
        if depth != 0 {
            return Err(Error::new(
                ErrorCode::InvalidFilter,
                format!("unbalanced brackets in channel filter: {}", filter),
            ));
        }

        let ids: HashSet<u32> = EVENT_ID_IN_FILTER
            .captures_iter(filter)
            .filter_map(|cap| cap[1].parse().ok())
            .collect();

        Ok(Self {
            event_ids: if ids.is_empty() { None } else { Some(ids) },
        })
    }

    pub fn matches(&self, record: &RawRecord) -> bool {
        match &self.event_ids {
            Some(ids) => ids.contains(&record.event_id),
            None => true,
        }
    }
}

/// On-disk line shape consumed by [`JsonlFileSource`].
#[derive(Debug, Deserialize)]
struct JsonlRecord {
    event_id: u32,
    time_created: DateTime<Utc>,
    host: String,
    #[serde(default)]
    xml_payload: String,
    #[serde(default)]
    fields: HashMap<String, String>,
}

/// File-tailing source: one `<dir>/<channel>.jsonl` file per channel, line
/// number as the bookmark token.
pub struct JsonlFileSource {
    dir: PathBuf,
    poll_interval: Duration,
}

impl JsonlFileSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn channel_path(&self, channel: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", channel))
    }
}

#[async_trait]
impl ChannelSource for JsonlFileSource {
    async fn subscribe(
        &self,
        channel: &ChannelConfig,
        from_token: Option<u64>,
    ) -> Result<BoxStream<'static, Result<RawRecord>>> {
        let filter = ChannelFilter::parse(channel.xpath_filter.as_deref())?;
        let path = self.channel_path(&channel.name);
        if !self.dir.exists() {
            return Err(Error::new(
                ErrorCode::ChannelUnavailable,
                format!("channel source directory {} missing", self.dir.display()),
            ));
        }

        let channel_name = channel.name.clone();
        let poll_interval = self.poll_interval;
        let mut next_line: u64 = from_token.map(|t| t + 1).unwrap_or(1);

        let stream = async_stream::stream! {
            loop {
                let content = match tokio::fs::read_to_string(&path).await {
                    Ok(content) => content,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        // Channel file not written yet; keep polling.
                        tokio::time::sleep(poll_interval).await;
                        continue;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                        yield Err(Error::new(
                            ErrorCode::ChannelPermissionDenied,
                            format!("cannot read channel file {}", path.display()),
                        ));
                        return;
                    }
                    Err(e) => {
                        yield Err(Error::new(
                            ErrorCode::ChannelUnavailable,
                            format!("channel read failed: {}", e),
                        ));
                        return;
                    }
                };

                let mut produced = false;
                for (idx, line) in content.lines().enumerate() {
                    let line_no = idx as u64 + 1;
                    if line_no < next_line || line.trim().is_empty() {
                        continue;
                    }
                    next_line = line_no + 1;
                    produced = true;

                    match serde_json::from_str::<JsonlRecord>(line) {
                        Ok(parsed) => {
                            let record = RawRecord {
                                channel: channel_name.clone(),
                                event_id: parsed.event_id,
                                time_created: parsed.time_created,
                                xml_payload: parsed.xml_payload,
                                host: parsed.host,
                                bookmark_token: line_no,
                                fields: parsed.fields,
                            };
                            if filter.matches(&record) {
                                yield Ok(record);
                            }
                        }
                        Err(e) => {
                            yield Err(Error::new(
                                ErrorCode::MalformedRecord,
                                format!("line {} of {}: {}", line_no, channel_name, e),
                            )
                            .add_metadata("bookmark_token", serde_json::json!(line_no)));
                        }
                    }
                }

                if !produced {
                    tokio::time::sleep(poll_interval).await;
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn channel(name: &str, filter: Option<&str>) -> ChannelConfig {
        ChannelConfig {
            name: name.into(),
            enabled: true,
            xpath_filter: filter.map(str::to_owned),
            max_queue: 100,
            bookmark_persistence: true,
            overflow_policy: Default::default(),
        }
    }

    #[test]
    fn filter_extracts_event_ids() {
        let filter =
            ChannelFilter::parse(Some("*[System[(EventID=4624 or EventID=4625)]]")).unwrap();
        let mut record = RawRecord {
            channel: "Security".into(),
            event_id: 4625,
            time_created: Utc::now(),
            xml_payload: String::new(),
            host: "h".into(),
            bookmark_token: 1,
            fields: HashMap::new(),
        };
        assert!(filter.matches(&record));
        record.event_id = 4688;
        assert!(!filter.matches(&record));
    }

    #[test]
    fn unbalanced_filter_is_invalid() {
        let err = ChannelFilter::parse(Some("*[System[(EventID=1)]")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidFilter);
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = ChannelFilter::parse(None).unwrap();
        let record = RawRecord {
            channel: "Security".into(),
            event_id: 1,
            time_created: Utc::now(),
            xml_payload: String::new(),
            host: "h".into(),
            bookmark_token: 1,
            fields: HashMap::new(),
        };
        assert!(filter.matches(&record));
    }

    #[tokio::test]
    async fn jsonl_source_resumes_after_bookmark() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Security.jsonl");
        let now = Utc::now().to_rfc3339();
        let lines: Vec<String> = (1..=3)
            .map(|i| {
                format!(
                    r#"{{"event_id": {}, "time_created": "{}", "host": "WIN-1"}}"#,
                    4620 + i,
                    now
                )
            })
            .collect();
        tokio::fs::write(&path, lines.join("\n")).await.unwrap();

        let source = JsonlFileSource::new(dir.path());
        let mut stream = source
            .subscribe(&channel("Security", None), Some(1))
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.event_id, 4622);
        assert_eq!(first.bookmark_token, 2);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.bookmark_token, 3);
    }

    #[tokio::test]
    async fn malformed_lines_surface_as_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Security.jsonl");
        tokio::fs::write(&path, "not json\n").await.unwrap();

        let source = JsonlFileSource::new(dir.path());
        let mut stream = source
            .subscribe(&channel("Security", None), None)
            .await
            .unwrap();

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.code, ErrorCode::MalformedRecord);
    }
}

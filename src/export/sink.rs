use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::EntityKind;
use crate::error::{Result, SyncError};

/// A destination for exported records.
///
/// Every sink is called once per entity kind and must not depend on any other
/// sink succeeding.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, kind: EntityKind, records: &[Value]) -> Result<()>;
}

#[derive(Serialize)]
struct HttpBatch<'a> {
    kind: EntityKind,
    records: &'a [Value],
}

/// Posts each batch as JSON to `<address>/v1/<kind>`.
pub struct HttpSink {
    client: Client,
    address: String,
}

impl HttpSink {
    pub fn new(address: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            address: address.trim_end_matches('/').to_string(),
        })
    }

    fn sink_error(&self, kind: EntityKind, message: impl ToString) -> SyncError {
        SyncError::Sink {
            sink: self.address.clone(),
            kind: kind.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        &self.address
    }

    async fn send(&self, kind: EntityKind, records: &[Value]) -> Result<()> {
        let url = format!("{}/v1/{}", self.address, kind);
        debug!("POST {url} ({} records)", records.len());

        let response = self
            .client
            .post(&url)
            .json(&HttpBatch { kind, records })
            .send()
            .await
            .map_err(|e| self.sink_error(kind, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.sink_error(kind, format!("status {status}: {body}")));
        }

        Ok(())
    }
}

#[derive(Serialize)]
struct FileLine<'a> {
    kind: EntityKind,
    record: &'a Value,
}

/// Appends one JSON line per record. The path `-` writes to stdout.
pub struct FileSink {
    name: String,
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl FileSink {
    pub fn new(path: &str) -> Self {
        Self {
            name: path.to_string(),
            path: (path != "-").then(|| PathBuf::from(path)),
            lock: Mutex::new(()),
        }
    }

    async fn write_to<W>(&self, out: &mut W, kind: EntityKind, records: &[Value]) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, &FileLine { kind, record })?;
            buf.push(b'\n');
        }
        out.write_all(&buf).await?;
        out.flush().await?;
        Ok(())
    }

    async fn append(&self, kind: EntityKind, records: &[Value]) -> Result<()> {
        match &self.path {
            Some(path) => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                self.write_to(&mut file, kind, records).await
            }
            None => self.write_to(&mut tokio::io::stdout(), kind, records).await,
        }
    }
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, kind: EntityKind, records: &[Value]) -> Result<()> {
        let _guard = self.lock.lock().await;

        self.append(kind, records)
            .await
            .map_err(|e| SyncError::Sink {
                sink: self.name.clone(),
                kind: kind.to_string(),
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
pub(crate) mod recording {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;

    /// Keeps everything it receives; fails for the kinds it was told to.
    #[derive(Default)]
    pub struct RecordingSink {
        pub failing: HashSet<EntityKind>,
        received: Mutex<Vec<(EntityKind, Vec<Value>)>>,
    }

    impl RecordingSink {
        pub fn failing_on(kinds: &[EntityKind]) -> Self {
            Self {
                failing: kinds.iter().copied().collect(),
                ..Self::default()
            }
        }

        pub fn count(&self, kind: EntityKind) -> usize {
            self.received
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, records)| records.len())
                .sum()
        }

        pub fn records(&self, kind: EntityKind) -> Vec<Value> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| *k == kind)
                .flat_map(|(_, records)| records.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, kind: EntityKind, records: &[Value]) -> Result<()> {
            if self.failing.contains(&kind) {
                return Err(SyncError::Sink {
                    sink: "recording".into(),
                    kind: kind.to_string(),
                    message: "refused".into(),
                });
            }
            self.received
                .lock()
                .unwrap()
                .push((kind, records.to_vec()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn http_sink_posts_batches_per_kind() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/pipelines")
            .match_body(Matcher::Json(json!({
                "kind": "pipelines",
                "records": [{"id": 1}, {"id": 2}]
            })))
            .with_status(202)
            .create_async()
            .await;

        let sink = HttpSink::new(&format!("{}/", server.url()), None).unwrap();
        sink.send(EntityKind::Pipelines, &[json!({"id": 1}), json!({"id": 2})])
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_sink_reports_rejections() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/jobs")
            .with_status(400)
            .with_body("bad batch")
            .create_async()
            .await;

        let sink = HttpSink::new(&server.url(), None).unwrap();
        let err = sink
            .send(EntityKind::Jobs, &[json!({})])
            .await
            .unwrap_err();

        match err {
            SyncError::Sink { kind, message, .. } => {
                assert_eq!(kind, "jobs");
                assert!(message.contains("bad batch"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let sink = FileSink::new(path.to_str().unwrap());

        sink.send(EntityKind::Runners, &[json!({"id": 1})])
            .await
            .unwrap();
        sink.send(EntityKind::Deployments, &[json!({"id": 2}), json!({"id": 3})])
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], json!({"kind": "runners", "record": {"id": 1}}));
        assert_eq!(lines[2]["kind"], "deployments");
    }

    #[tokio::test]
    async fn file_sink_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.jsonl");
        let sink = FileSink::new(path.to_str().unwrap());

        assert!(sink.send(EntityKind::Jobs, &[json!({})]).await.is_err());
    }
}

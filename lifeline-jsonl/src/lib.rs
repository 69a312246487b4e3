//! JSONL sink for `lifeline`. Writes one invocation record per line.
//! Always appends; bring your own path.

use lifeline::telemetry::{record_to_json, InvocationRecord, TelemetrySink};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: String,
    failures_only: bool,
}

impl JsonlSink {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self { path: path.into(), failures_only: false }
    }

    /// Skip records of invocations that succeeded.
    pub fn failures_only(mut self) -> Self {
        self.failures_only = true;
        self
    }
}

impl tower_service::Service<InvocationRecord> for JsonlSink {
    type Response = ();
    type Error = io::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: InvocationRecord) -> Self::Future {
        if self.failures_only && record.outcome.is_success() {
            return Box::pin(async { Ok(()) });
        }
        let path = self.path.clone();
        let line = record_to_json(&record).to_string() + "\n";
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let mut file =
                tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            tracing::trace!(path = %path, "invocation record written");
            Ok(())
        })
    }
}

impl TelemetrySink for JsonlSink {
    type SinkError = io::Error;
}

use super::events::InvocationRecord;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tower::Service;

/// A log sink that consumes invocation records.
pub trait TelemetrySink:
    tower::Service<InvocationRecord, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, record: InvocationRecord)
where
    S: tower::Service<InvocationRecord, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(record).await;
    }
}

type EmitFn = dyn Fn(InvocationRecord) -> BoxFuture<'static, ()> + Send + Sync;

/// Type-erased sink stored by the proxy factory.
#[derive(Clone)]
pub struct SinkHandle {
    emit: Arc<EmitFn>,
}

impl fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkHandle").finish_non_exhaustive()
    }
}

impl Default for SinkHandle {
    fn default() -> Self {
        Self::new(NullSink)
    }
}

impl SinkHandle {
    pub fn new<S>(sink: S) -> Self
    where
        S: TelemetrySink,
        S::Future: Send + 'static,
    {
        let sink = Arc::new(Mutex::new(sink));
        Self {
            emit: Arc::new(move |record| {
                let sink = sink.lock().unwrap_or_else(PoisonError::into_inner).clone();
                Box::pin(emit_best_effort(sink, record))
            }),
        }
    }

    /// Deliver a record. Never fails.
    pub async fn emit(&self, record: InvocationRecord) {
        (self.emit)(record).await
    }
}

/// A no-op sink that discards all records.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<InvocationRecord> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _record: InvocationRecord) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A sink that writes records through `tracing`: a summary line per invocation plus one debug
/// line per failed attempt.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<InvocationRecord> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: InvocationRecord) -> Self::Future {
        for (index, attempt) in record.attempts.iter().enumerate() {
            if let Some(err) = &attempt.error {
                tracing::debug!(
                    id = %record.id,
                    attempt = index + 1,
                    endpoint = %attempt.endpoint,
                    kind = %err.kind,
                    elapsed_ms = attempt.elapsed.as_millis() as u64,
                    error = %err.message,
                    "invocation_attempt_failed"
                );
            }
        }
        tracing::info!(
            id = %record.id,
            contract = %record.contract,
            operation = %record.operation,
            cache_mode = %record.cache_mode,
            attempts = record.attempts.len(),
            outcome = %record.outcome,
            elapsed_ms = record.total_elapsed.as_millis() as u64,
            "invocation"
        );
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A sink that keeps the most recent records in memory. Oldest records are evicted first.
#[derive(Clone, Debug)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<InvocationRecord>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<InvocationRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn records(&self) -> Vec<InvocationRecord> {
        self.lock().clone()
    }

    /// Most recent record.
    pub fn last(&self) -> Option<InvocationRecord> {
        self.lock().last().cloned()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<InvocationRecord> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: InvocationRecord) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(record);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

/// Hands records to a bounded channel drained by a worker task, so a slow sink never delays the
/// caller. Records are dropped (and counted) when the channel is full.
#[derive(Clone)]
pub struct NonBlockingSink {
    tx: tokio::sync::mpsc::Sender<InvocationRecord>,
    dropped: Arc<AtomicU64>,
}

impl fmt::Debug for NonBlockingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonBlockingSink").field("dropped", &self.dropped()).finish()
    }
}

impl NonBlockingSink {
    /// Must be called inside a tokio runtime.
    pub fn with_capacity<S>(sink: S, capacity: usize) -> Self
    where
        S: tower::Service<InvocationRecord, Response = ()> + Send + Clone + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                emit_best_effort(sink.clone(), record).await;
            }
        });
        Self { tx, dropped: Arc::new(AtomicU64::new(0)) }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl tower::Service<InvocationRecord> for NonBlockingSink {
    type Response = ();
    type Error = Infallible;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: InvocationRecord) -> Self::Future {
        if self.tx.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NonBlockingSink {
    type SinkError = Infallible;
}

#[derive(Debug)]
pub struct ComposedSinkError(Box<dyn std::error::Error + Send + Sync>);

impl fmt::Display for ComposedSinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log sink error: {}", self.0)
    }
}

impl std::error::Error for ComposedSinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.0)
    }
}

/// Delivers every record to two sinks.
#[derive(Clone, Debug)]
pub struct MulticastSink<A, B> {
    sink_a: A,
    sink_b: B,
}

impl<A, B> MulticastSink<A, B> {
    pub fn new(sink_a: A, sink_b: B) -> Self {
        Self { sink_a, sink_b }
    }
}

impl<A, B> Service<InvocationRecord> for MulticastSink<A, B>
where
    A: tower::Service<InvocationRecord, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<InvocationRecord, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type Response = ();
    type Error = ComposedSinkError;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, record: InvocationRecord) -> Self::Future {
        let mut sink_a = self.sink_a.clone();
        let mut sink_b = self.sink_b.clone();
        let record_clone = record.clone();

        Box::pin(async move {
            let (res_a, res_b) = tokio::join!(sink_a.call(record), sink_b.call(record_clone));
            res_a.map_err(|e| ComposedSinkError(Box::new(e)))?;
            res_b.map_err(|e| ComposedSinkError(Box::new(e)))?;
            Ok(())
        })
    }
}

impl<A, B> TelemetrySink for MulticastSink<A, B>
where
    A: tower::Service<InvocationRecord, Response = ()> + Clone + Send + 'static,
    A::Error: std::error::Error + Send + Sync + 'static,
    A::Future: Send + 'static,
    B: tower::Service<InvocationRecord, Response = ()> + Clone + Send + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
    B::Future: Send + 'static,
{
    type SinkError = ComposedSinkError;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::events::sample_record;
    use std::future::Future;
    use std::time::Duration;

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let mut sink = MemorySink::with_capacity(2);
        assert!(sink.is_empty());

        let mut first = sample_record();
        first.operation = "first".into();
        let mut second = sample_record();
        second.operation = "second".into();
        let mut third = sample_record();
        third.operation = "third".into();

        sink.call(first).await.unwrap();
        sink.call(second.clone()).await.unwrap();
        sink.call(third.clone()).await.unwrap();

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(sink.records(), vec![second, third.clone()]);
        assert_eq!(sink.last(), Some(third));

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn multicast_reaches_both_sinks() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let mut both = MulticastSink::new(a.clone(), b.clone());
        both.call(sample_record()).await.unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn non_blocking_sink_forwards_in_background() {
        let memory = MemorySink::new();
        let mut sink = NonBlockingSink::with_capacity(memory.clone(), 8);
        sink.call(sample_record()).await.unwrap();

        for _ in 0..50 {
            if memory.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(memory.len(), 1);
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn sink_handle_erases_type() {
        let memory = MemorySink::new();
        let handle = SinkHandle::new(memory.clone());
        handle.emit(sample_record()).await;
        handle.clone().emit(sample_record()).await;
        assert_eq!(memory.len(), 2);
    }

    #[tokio::test]
    async fn emit_best_effort_swallows_errors() {
        #[derive(Clone)]
        struct Fails;
        impl TelemetrySink for Fails {
            type SinkError = std::io::Error;
        }
        impl tower::Service<InvocationRecord> for Fails {
            type Response = ();
            type Error = std::io::Error;
            type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;
            fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
                Poll::Ready(Ok(()))
            }
            fn call(&mut self, _req: InvocationRecord) -> Self::Future {
                Box::pin(async { Err(std::io::Error::new(std::io::ErrorKind::Other, "fail")) })
            }
        }

        emit_best_effort(Fails, sample_record()).await;
        SinkHandle::new(Fails).emit(sample_record()).await;
    }

    #[tokio::test]
    async fn log_sink_accepts_records() {
        let mut sink = LogSink;
        sink.call(sample_record()).await.unwrap();
    }
}

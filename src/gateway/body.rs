//! Streamed response bodies that report how they ended.

use std::time::Instant;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};

use super::tasks::BackgroundTasks;

pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamEnd {
    Completed,
    Error,
    /// The client went away before the upstream finished.
    Aborted,
}

#[derive(Clone, Debug)]
pub struct StreamSummary {
    pub end: StreamEnd,
    pub bytes_sent: u64,
    pub time_to_first_chunk_ms: Option<u64>,
    /// Leading bytes of the body, up to the capture limit.
    pub captured: Bytes,
}

pub type StreamFinalizer = Box<dyn FnOnce(StreamSummary) -> BoxFuture<'static, ()> + Send>;

struct StreamState {
    upstream: ByteStream,
    started: Instant,
    bytes_sent: u64,
    first_chunk_ms: Option<u64>,
    captured: Vec<u8>,
    capture_limit: usize,
    finalizer: Option<StreamFinalizer>,
    tasks: BackgroundTasks,
}

impl StreamState {
    fn record(&mut self, chunk: &Bytes) {
        if self.first_chunk_ms.is_none() {
            self.first_chunk_ms = Some(self.started.elapsed().as_millis() as u64);
        }
        self.bytes_sent = self.bytes_sent.saturating_add(chunk.len() as u64);
        let room = self.capture_limit.saturating_sub(self.captured.len());
        self.captured
            .extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    fn finish(&mut self, end: StreamEnd) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        let summary = StreamSummary {
            end,
            bytes_sent: self.bytes_sent,
            time_to_first_chunk_ms: self.first_chunk_ms,
            captured: Bytes::from(std::mem::take(&mut self.captured)),
        };
        self.tasks.spawn("stream_finalize", finalizer(summary));
    }
}

impl Drop for StreamState {
    fn drop(&mut self) {
        self.finish(StreamEnd::Aborted);
    }
}

/// Wraps `upstream` so `finalizer` runs exactly once, in the background, when the stream
/// completes, errors, or is dropped early.
pub fn observe_stream(
    upstream: ByteStream,
    started: Instant,
    capture_limit: usize,
    tasks: BackgroundTasks,
    finalizer: StreamFinalizer,
) -> ByteStream {
    let state = StreamState {
        upstream,
        started,
        bytes_sent: 0,
        first_chunk_ms: None,
        captured: Vec::new(),
        capture_limit,
        finalizer: Some(finalizer),
        tasks,
    };

    futures_util::stream::try_unfold(state, |mut state| async move {
        match state.upstream.next().await {
            Some(Ok(chunk)) => {
                state.record(&chunk);
                Ok(Some((chunk, state)))
            }
            Some(Err(err)) => {
                state.finish(StreamEnd::Error);
                Err(err)
            }
            None => {
                state.finish(StreamEnd::Completed);
                Ok(None)
            }
        }
    })
    .into_stream()
    .boxed()
}

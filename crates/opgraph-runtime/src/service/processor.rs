//! Response processors and the values passed between them.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use opgraph_core::OpError;

use super::request::ServiceRequest;

/// Input to, and output of, a response processor.
///
/// `Bytes` and `Stream` are intermediate values a further processor may
/// consume. `Processed` and `Error` are terminal.
pub enum ResponsePayload {
    Bytes(Bytes),
    Stream(BoxStream<'static, Result<Bytes, OpError>>),
    /// Processing ended; `false` means the input was not fully handled.
    Processed(bool),
    Error(OpError),
}

impl ResponsePayload {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponsePayload::Processed(_) | ResponsePayload::Error(_))
    }
}

impl fmt::Debug for ResponsePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponsePayload::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            ResponsePayload::Stream(_) => f.write_str("Stream"),
            ResponsePayload::Processed(done) => f.debug_tuple("Processed").field(done).finish(),
            ResponsePayload::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// Consumes a fetched response: parses it, persists it, or hands a
/// transformed payload on.
#[async_trait]
pub trait ResponseProcessor: Send + Sync {
    async fn process(&self, request: &ServiceRequest, input: ResponsePayload) -> ResponsePayload;
}

/// Runs processors in order, feeding each one's output to the next, until
/// one returns a terminal payload.
pub struct PipelineProcessor {
    processors: Vec<Arc<dyn ResponseProcessor>>,
}

impl PipelineProcessor {
    pub fn new(processors: Vec<Arc<dyn ResponseProcessor>>) -> Self {
        Self { processors }
    }
}

#[async_trait]
impl ResponseProcessor for PipelineProcessor {
    async fn process(&self, request: &ServiceRequest, input: ResponsePayload) -> ResponsePayload {
        let mut current = input;
        for processor in &self.processors {
            current = processor.process(request, current).await;
            if current.is_terminal() {
                break;
            }
        }
        current
    }
}

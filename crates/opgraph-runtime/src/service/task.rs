//! Fetch-then-process as a single unit.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use opgraph_core::OpError;

use super::fetch::ResponseFetcher;
use super::processor::{ResponsePayload, ResponseProcessor};
use super::request::ServiceRequest;
use crate::conditions::DependencySuccessCondition;
use crate::config::QueueConfig;
use crate::group::TaskGroup;
use crate::observers::TimeoutObserver;
use crate::unit::TaskUnit;

type Slot = Arc<Mutex<Option<ResponsePayload>>>;

/// A group of two units: fetch the response, then process it.
///
/// The process step only runs if the fetch succeeded. The whole group is
/// cancelled with `TimedOut` once `request.timeout` elapses after it starts.
pub struct ServiceRequestTask {
    group: TaskGroup,
    request: Arc<ServiceRequest>,
}

impl ServiceRequestTask {
    pub fn new(
        request: ServiceRequest,
        fetcher: Arc<dyn ResponseFetcher>,
        processor: Arc<dyn ResponseProcessor>,
    ) -> Self {
        let children = QueueConfig::named(format!("fetch {}/children", request.url));
        Self::with_config(request, fetcher, processor, children)
    }

    /// Like [`ServiceRequestTask::new`], with `children` configuring the
    /// group's queue.
    pub fn with_config(
        request: ServiceRequest,
        fetcher: Arc<dyn ResponseFetcher>,
        processor: Arc<dyn ResponseProcessor>,
        children: QueueConfig,
    ) -> Self {
        let request = Arc::new(request);
        let slot: Slot = Arc::new(Mutex::new(None));

        let fetch = fetch_unit(request.clone(), fetcher, slot.clone());
        let process = process_unit(request.clone(), processor, slot);
        // Added while both are initialized.
        let _ = process.add_dependency(&fetch);
        let _ = process.add_condition(DependencySuccessCondition::new());

        let group = TaskGroup::with_config(format!("fetch {}", request.url), children, [fetch, process]);
        let _ = group.unit().add_observer(TimeoutObserver::new(request.timeout));

        Self { group, request }
    }

    pub fn request(&self) -> &ServiceRequest {
        &self.request
    }

    pub fn unit(&self) -> &TaskUnit {
        self.group.unit()
    }

    pub fn into_unit(self) -> TaskUnit {
        self.group.into_unit()
    }
}

fn fetch_unit(request: Arc<ServiceRequest>, fetcher: Arc<dyn ResponseFetcher>, slot: Slot) -> TaskUnit {
    TaskUnit::block(format!("download {}", request.url), move |ctx| async move {
        let fetched = tokio::select! {
            // The cancellation error is already recorded on the unit.
            _ = ctx.cancelled() => return Ok(()),
            fetched = fetcher.fetch(&request) => fetched?,
        };
        if fetched.is_none() {
            debug!(url = %request.url, "Response has no body");
        }
        *slot.lock().unwrap_or_else(|e| e.into_inner()) = fetched;
        Ok(())
    })
}

fn process_unit(
    request: Arc<ServiceRequest>,
    processor: Arc<dyn ResponseProcessor>,
    slot: Slot,
) -> TaskUnit {
    TaskUnit::block(format!("process {}", request.url), move |ctx| async move {
        let input = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(input) = input else {
            return Err(OpError::NoData);
        };

        let output = tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            output = processor.process(&request, input) => output,
        };
        match output {
            ResponsePayload::Processed(true) | ResponsePayload::Bytes(_) | ResponsePayload::Stream(_) => Ok(()),
            ResponsePayload::Processed(false) => {
                warn!(url = %request.url, "Response was not fully processed");
                Err(OpError::NotProcessed)
            }
            ResponsePayload::Error(e) => Err(e),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ExecutionQueue;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    enum Reply {
        Body(&'static str),
        Empty,
        Fail,
        Hang,
    }

    struct StubFetcher(Reply);

    #[async_trait]
    impl ResponseFetcher for StubFetcher {
        async fn fetch(&self, _request: &ServiceRequest) -> Result<Option<ResponsePayload>, OpError> {
            match self.0 {
                Reply::Body(body) => Ok(Some(ResponsePayload::Bytes(Bytes::from_static(body.as_bytes())))),
                Reply::Empty => Ok(None),
                Reply::Fail => Err(OpError::execution("HTTP 503")),
                Reply::Hang => {
                    std::future::pending::<()>().await;
                    Ok(None)
                }
            }
        }
    }

    /// Marks "done" as processed, "partial" as unprocessed, anything else as an error.
    #[derive(Default)]
    struct Judge {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ResponseProcessor for Judge {
        async fn process(&self, _request: &ServiceRequest, input: ResponsePayload) -> ResponsePayload {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match input {
                ResponsePayload::Bytes(bytes) if bytes.as_ref() == b"done" => ResponsePayload::Processed(true),
                ResponsePayload::Bytes(bytes) if bytes.as_ref() == b"partial" => ResponsePayload::Processed(false),
                ResponsePayload::Bytes(bytes) if bytes.as_ref() == b"raw" => ResponsePayload::Bytes(bytes),
                _ => ResponsePayload::Error(OpError::execution("malformed")),
            }
        }
    }

    async fn run(reply: Reply, timeout: Duration) -> (TaskUnit, Arc<Judge>) {
        let judge = Arc::new(Judge::default());
        let task = ServiceRequestTask::new(
            ServiceRequest::get("https://example.com/feed").with_timeout(timeout),
            Arc::new(StubFetcher(reply)),
            judge.clone(),
        );
        let queue = ExecutionQueue::new(QueueConfig::named("service"));
        let unit = task.into_unit();
        queue.submit(unit.clone());
        unit.finished().await;
        (unit, judge)
    }

    #[tokio::test]
    async fn test_processed_response() {
        let (unit, judge) = run(Reply::Body("done"), Duration::from_secs(5)).await;
        assert!(!unit.failed());
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unconsumed_payload_is_success() {
        let (unit, _) = run(Reply::Body("raw"), Duration::from_secs(5)).await;
        assert!(unit.errors().is_empty());
    }

    #[tokio::test]
    async fn test_not_processed() {
        let (unit, _) = run(Reply::Body("partial"), Duration::from_secs(5)).await;
        assert_eq!(unit.errors(), vec![OpError::NotProcessed]);
    }

    #[tokio::test]
    async fn test_processor_error() {
        let (unit, _) = run(Reply::Body("garbage"), Duration::from_secs(5)).await;
        assert_eq!(unit.errors(), vec![OpError::execution("malformed")]);
    }

    #[tokio::test]
    async fn test_empty_response_is_no_data() {
        let (unit, judge) = run(Reply::Empty, Duration::from_secs(5)).await;
        assert_eq!(unit.errors(), vec![OpError::NoData]);
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_fetch_skips_processing() {
        let (unit, judge) = run(Reply::Fail, Duration::from_secs(5)).await;
        let errors = unit.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&OpError::execution("HTTP 503")));
        assert!(errors.iter().any(|e| matches!(e, OpError::DependencyFailed { .. })));
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hanging_fetch_times_out() {
        let (unit, judge) = run(Reply::Hang, Duration::from_millis(30)).await;
        let errors = unit.errors();
        assert_eq!(errors.first(), Some(&OpError::TimedOut { after_ms: 30 }));
        assert!(errors.iter().all(OpError::is_cancellation));
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_children_queue_config_is_honoured() {
        let task = ServiceRequestTask::with_config(
            ServiceRequest::get("https://example.com/feed"),
            Arc::new(StubFetcher(Reply::Body("done"))),
            Arc::new(Judge::default()),
            QueueConfig::named("one-slot").with_max_concurrent(1),
        );
        assert_eq!(task.group.queue().config().max_concurrent, 1);

        let queue = ExecutionQueue::new(QueueConfig::named("service").with_max_concurrent(1));
        let unit = task.into_unit();
        queue.submit(unit.clone());
        tokio::time::timeout(Duration::from_secs(5), unit.finished())
            .await
            .expect("fetch group stalled");
        assert!(unit.errors().is_empty());
    }
}

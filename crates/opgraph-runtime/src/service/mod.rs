//! The boundary to network services: fetch a request, hand the response to a
//! processor.

mod fetch;
mod processor;
mod request;
mod task;

pub use fetch::{HttpFetcher, ResponseFetcher};
pub use processor::{PipelineProcessor, ResponsePayload, ResponseProcessor};
pub use request::{HttpMethod, ServiceRequest, DEFAULT_REQUEST_TIMEOUT};
pub use task::ServiceRequestTask;

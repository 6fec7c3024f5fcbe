//! Inbound webhook API.

mod server;
mod types;

pub use server::{ApiError, ApiServer, build_router};
pub use types::{
    EXTRAS_PAYLOAD_KEY, EnqueueResponse, ErrorDetail, ErrorResponse, HealthResponse,
    NormalizedPayload, WebhookPayload, parse_time_frame,
};

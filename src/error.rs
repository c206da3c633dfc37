use thiserror::Error;

/// Failure while delivering an outbound message through a platform API.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("platform api error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("connection config missing {0}")]
    Config(&'static str),
}

/// What went wrong while processing a single inbound event. One event
/// failing never fails the webhook delivery it arrived in.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("customer lookup-or-create failed: {0}")]
    IdentityResolution(#[source] sqlx::Error),
    #[error("chat reconciliation failed: {0}")]
    Reconciliation(#[source] sqlx::Error),
    #[error("outbound send failed: {0}")]
    OutboundSend(#[from] SendError),
}

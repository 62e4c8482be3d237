//! Backend collaborators consumed by the workflow controllers.
//!
//! Transport is not modelled here. Every call yields either its payload or an
//! [`ApiError`] carrying a user-presentable message, which is all the
//! controllers depend on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

/// Failure envelope returned by the API layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Account verification status as reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityStatusReport {
    pub verified: bool,
    pub under_review: bool,
}

/// Outcome of a provider-side face verification, looked up by token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub status: String,
    pub face_matched: bool,
    pub reason_code: Option<String>,
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn fetch_status(&self) -> ApiResult<IdentityStatusReport>;

    /// Register the applicant and obtain the provider page to redirect to.
    async fn start_verification(&self, real_name: &str, id_card: &str, return_url: &str) -> ApiResult<String>;

    async fn fetch_verification_result(&self, auth_token: &str) -> ApiResult<VerificationResult>;

    /// Finalise the verification once the provider result has been accepted.
    async fn submit_verification(&self, auth_token: &str) -> ApiResult<()>;
}

/// Server-side consignment unlock signal for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConsignmentEligibility {
    pub unlocked: bool,
    pub remaining_seconds: Option<u64>,
    /// The lock is the holding window rather than some other rule.
    pub time_locked: bool,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRequest {
    pub item_id: String,
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsignmentRequest {
    pub item_id: String,
    pub price: f64,
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait DispositionApi: Send + Sync {
    async fn consignment_eligibility(&self, item_id: &str) -> ApiResult<ServerConsignmentEligibility>;

    async fn request_delivery(&self, request: DeliveryRequest) -> ApiResult<()>;

    async fn request_consignment(&self, request: ConsignmentRequest) -> ApiResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLink {
    pub url: String,
    pub issued_at: DateTime<Utc>,
}

#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait PaymentApi: Send + Sync {
    async fn fetch_payment_link(&self, order_id: &str) -> ApiResult<PaymentLink>;
}

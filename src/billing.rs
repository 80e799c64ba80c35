//! Billing integration.
//!
//! Talks to the payment provider's REST API (form-encoded, bearer auth) to
//! create customers and checkout sessions, and verifies inbound webhook
//! signatures before any event is processed.
//!
//! The signature header carries a unix timestamp and an HMAC-SHA256 over
//! `"{timestamp}.{payload}"`; verification is constant-time and rejects
//! timestamps outside a fixed tolerance to blunt replay.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use crate::config::BillingConfig;
use crate::errors::BillingError;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between the webhook timestamp and our clock.
pub const WEBHOOK_TOLERANCE_SECS: i64 = 300;

#[derive(Clone)]
pub struct BillingClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

#[derive(Debug, Deserialize)]
struct CustomerResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

impl BillingClient {
    pub fn new(config: &BillingConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            secret_key: config.secret_key.clone(),
        }
    }

    /// Create a provider-side customer tagged with our user id.
    pub async fn create_customer(&self, user_id: &str) -> Result<String, BillingError> {
        let resp = self
            .http
            .post(format!("{}/v1/customers", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(&[("metadata[user_id]", user_id)])
            .send()
            .await
            .map_err(BillingError::Request)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BillingError::Provider { status, body });
        }
        let customer: CustomerResponse = resp.json().await.map_err(BillingError::Request)?;
        debug!(customer_id = %customer.id, "billing customer created");
        Ok(customer.id)
    }

    /// Open a subscription checkout session for an existing customer.
    pub async fn create_checkout_session(
        &self,
        customer_id: &str,
        price_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutSession, BillingError> {
        let resp = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(&[
                ("customer", customer_id),
                ("mode", "subscription"),
                ("line_items[0][price]", price_id),
                ("line_items[0][quantity]", "1"),
                ("success_url", success_url),
                ("cancel_url", cancel_url),
            ])
            .send()
            .await
            .map_err(BillingError::Request)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(BillingError::Provider { status, body });
        }
        resp.json().await.map_err(BillingError::Request)
    }
}

/// Verify a webhook signature header of the form `t=<unix>,v1=<hex hmac>`.
///
/// `now` is passed in so the tolerance window is testable.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: i64,
) -> Result<(), BillingError> {
    let mut timestamp: Option<i64> = None;
    let mut signature: Option<Vec<u8>> = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => {
                timestamp = Some(value.parse().map_err(|_| BillingError::MalformedSignature)?);
            }
            Some(("v1", value)) => {
                signature = Some(hex::decode(value).map_err(|_| BillingError::MalformedSignature)?);
            }
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(BillingError::MalformedSignature)?;
    let signature = signature.ok_or(BillingError::MalformedSignature)?;

    if (now - timestamp).abs() > WEBHOOK_TOLERANCE_SECS {
        return Err(BillingError::StaleTimestamp);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::MalformedSignature)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    mac.verify_slice(&signature)
        .map_err(|_| BillingError::InvalidSignature)
}

/// Produce a header that [`verify_signature`] accepts, for exercising the
/// webhook path in tests.
#[cfg(test)]
pub(crate) fn sign_payload(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    format!("t={},v1={}", timestamp, hex::encode(digest))
}

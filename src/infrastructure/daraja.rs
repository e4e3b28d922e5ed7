//! M-Pesa STK push over the Daraja API.

use crate::config::DarajaConfig;
use crate::domain::money::Money;
use crate::domain::ports::{MobileMoneyGateway, PushOutcome, PushRequest};
use crate::error::{BillingError, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as base64};
use chrono::{DateTime, Utc};
use reqwest::{Client, header};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct AuthResponse {
    access_token: String,
    expires_in: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushBody {
    business_short_code: String,
    password: String,
    timestamp: String,
    transaction_type: &'static str,
    amount: String,
    party_a: String,
    party_b: String,
    phone_number: String,
    #[serde(rename = "CallBackURL")]
    callback_url: String,
    account_reference: String,
    transaction_desc: String,
}

#[derive(Debug, Deserialize)]
struct StkPushResponse {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    #[serde(rename = "ResponseCode")]
    response_code: String,
    #[serde(rename = "ResponseDescription")]
    response_description: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "errorMessage")]
    error_message: String,
}

/// Renewal margin before a cached token's expiry.
const TOKEN_MARGIN_MINUTES: i64 = 5;

/// [`MobileMoneyGateway`] backed by Safaricom's Daraja STK push.
///
/// Confirmation arrives out of band: the callback URL handler writes the
/// receipt onto the session row, which the push flow polls.
#[derive(Clone)]
pub struct DarajaGateway {
    config: DarajaConfig,
    client: Client,
    token: Arc<RwLock<Option<(String, DateTime<Utc>)>>>,
}

impl DarajaGateway {
    pub fn new(config: DarajaConfig) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            config,
            client,
            token: Arc::new(RwLock::new(None)),
        })
    }

    async fn access_token(&self) -> Result<String> {
        if let Some((token, expiry)) = self.token.read().await.as_ref()
            && *expiry > Utc::now() + chrono::Duration::minutes(TOKEN_MARGIN_MINUTES)
        {
            return Ok(token.clone());
        }

        debug!("requesting Daraja access token");
        let credentials = base64.encode(format!(
            "{}:{}",
            self.config.consumer_key, self.config.consumer_secret
        ));
        let response = self
            .client
            .get(self.config.auth_url())
            .header(header::AUTHORIZATION, format!("Basic {credentials}"))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(BillingError::GatewayError(format!(
                "M-Pesa auth failed: {status}"
            )));
        }

        let auth: AuthResponse = response.json().await?;
        let lifetime = auth.expires_in.trim().parse::<i64>().unwrap_or(3599);
        let expiry = Utc::now() + chrono::Duration::seconds(lifetime);
        *self.token.write().await = Some((auth.access_token.clone(), expiry));
        Ok(auth.access_token)
    }
}

/// `YYYYMMDDHHMMSS`, as Daraja expects.
fn timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

fn password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    base64.encode(format!("{short_code}{passkey}{timestamp}"))
}

/// STK push only takes whole shillings; fractions round up.
fn whole_amount(amount: Money) -> String {
    amount.value().ceil().normalize().to_string()
}

fn outcome_from(response: StkPushResponse) -> PushOutcome {
    if response.response_code == "0" {
        PushOutcome::Accepted {
            checkout_id: response.checkout_request_id,
        }
    } else {
        PushOutcome::Rejected {
            reason: response.response_description,
        }
    }
}

#[async_trait]
impl MobileMoneyGateway for DarajaGateway {
    async fn initiate_push(&self, request: PushRequest) -> Result<PushOutcome> {
        let token = self.access_token().await?;
        let stamp = timestamp(Utc::now());
        let phone = request.phone.as_str().to_string();
        let body = StkPushBody {
            business_short_code: self.config.short_code.clone(),
            password: password(&self.config.short_code, &self.config.passkey, &stamp),
            timestamp: stamp,
            transaction_type: "CustomerPayBillOnline",
            amount: whole_amount(request.amount),
            party_a: phone.clone(),
            party_b: self.config.short_code.clone(),
            phone_number: phone,
            callback_url: self.config.callback_url.clone(),
            account_reference: format!("SESSION-{}", request.session),
            transaction_desc: "Gaming session".to_string(),
        };

        let response = self
            .client
            .post(self.config.stk_push_url())
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let outcome = outcome_from(response.json().await?);
            match &outcome {
                PushOutcome::Accepted { checkout_id } => {
                    info!(session = %request.session, %checkout_id, "STK push sent")
                }
                PushOutcome::Rejected { reason } => {
                    warn!(session = %request.session, %reason, "STK push declined")
                }
            }
            return Ok(outcome);
        }

        let text = response.text().await?;
        if status.is_client_error()
            && let Ok(error) = serde_json::from_str::<ErrorResponse>(&text)
        {
            warn!(session = %request.session, %status, reason = %error.error_message, "STK push rejected");
            return Ok(PushOutcome::Rejected {
                reason: error.error_message,
            });
        }
        Err(BillingError::GatewayError(format!(
            "STK push failed with {status}: {text}"
        )))
    }
}

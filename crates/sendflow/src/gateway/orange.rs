use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{error_for_status, retry_after_from, GatewayError, MessageGateway, OutboundMessage, SendReceipt};
use crate::config::OrangeConfig;

// Refresh the OAuth token this long before Orange says it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Orange SMS API (OAuth2 client credentials + outbound SMS requests).
pub struct OrangeSmsGateway {
    http: Client,
    cfg: OrangeConfig,
    token: Mutex<Option<CachedToken>>,
}

impl OrangeSmsGateway {
    pub fn new(cfg: OrangeConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent("sendflow/orange")
            .timeout(cfg.timeout)
            .build()?;

        Ok(Self {
            http,
            cfg,
            token: Mutex::new(None),
        })
    }

    fn base_url(&self) -> &str {
        self.cfg.base_url.trim_end_matches('/')
    }

    fn sender_digits(&self) -> &str {
        self.cfg.sender_address.trim().trim_start_matches("tel:").trim_start_matches('+')
    }

    async fn access_token(&self) -> Result<String, GatewayError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let resp = self
            .http
            .post(format!("{}/oauth/v3/token", self.base_url()))
            .header(AUTHORIZATION, &self.cfg.authorization_header)
            .header(ACCEPT, "application/json")
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = retry_after_from(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(token_error(status, retry_after, body));
        }

        let token: TokenResponse = resp.json().await?;
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600)).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        tracing::debug!(lifetime_secs = lifetime.as_secs(), "refreshed orange access token");
        Ok(token.access_token)
    }

    async fn forget_token(&self) {
        *self.token.lock().await = None;
    }
}

// Bad credentials are an operator problem, not a problem with the message,
// so they must not burn through the queue as permanent failures.
fn token_error(status: StatusCode, retry_after: Option<Duration>, body: String) -> GatewayError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return GatewayError::Server {
            status: status.as_u16(),
            message: format!("orange token request rejected: {}", body.trim()),
        };
    }
    error_for_status(status, retry_after, body)
}

fn tel_uri(number: &str) -> String {
    let number = number.trim();
    if number.starts_with('+') {
        format!("tel:{number}")
    } else {
        format!("tel:+{number}")
    }
}

#[async_trait]
impl MessageGateway for OrangeSmsGateway {
    fn name(&self) -> &str {
        "orange-sms"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError> {
        let token = self.access_token().await?;
        let sender = self.sender_digits().to_string();

        let payload = SmsRequestEnvelope {
            outbound_sms_message_request: SmsRequest {
                address: tel_uri(&message.phone_number),
                sender_address: format!("tel:+{sender}"),
                sender_name: message.sender_name.clone().or_else(|| self.cfg.sender_name.clone()),
                outbound_sms_text_message: SmsText {
                    message: message.body.clone(),
                },
            },
        };

        let resp = self
            .http
            .post(format!(
                "{}/smsmessaging/v1/outbound/tel%3A%2B{}/requests",
                self.base_url(),
                sender
            ))
            .bearer_auth(&token)
            .header(ACCEPT, "application/json")
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            self.forget_token().await;
            return Err(GatewayError::Server {
                status: status.as_u16(),
                message: "orange rejected the access token".to_string(),
            });
        }
        if !status.is_success() {
            let retry_after = retry_after_from(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(error_for_status(status, retry_after, body));
        }

        let body: SmsResponseEnvelope = resp.json().await?;
        let external_message_id = body
            .outbound_sms_message_request
            .and_then(|r| r.resource_url)
            .and_then(|url| url.rsplit('/').next().map(str::to_string))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| {
                tracing::warn!(entry_id = %message.entry_id, "orange response carried no resourceURL");
                message.entry_id.to_string()
            });

        Ok(SendReceipt {
            external_message_id,
            provider: self.name().to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Serialize)]
struct SmsRequestEnvelope {
    #[serde(rename = "outboundSMSMessageRequest")]
    outbound_sms_message_request: SmsRequest,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SmsRequest {
    address: String,
    sender_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender_name: Option<String>,
    #[serde(rename = "outboundSMSTextMessage")]
    outbound_sms_text_message: SmsText,
}

#[derive(Debug, Serialize)]
struct SmsText {
    message: String,
}

#[derive(Debug, Deserialize)]
struct SmsResponseEnvelope {
    #[serde(rename = "outboundSMSMessageRequest")]
    outbound_sms_message_request: Option<SmsResponse>,
}

#[derive(Debug, Deserialize)]
struct SmsResponse {
    #[serde(rename = "resourceURL")]
    resource_url: Option<String>,
}

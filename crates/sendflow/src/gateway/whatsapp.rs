use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use super::{error_for_status, retry_after_from, GatewayError, MessageGateway, OutboundMessage, SendReceipt};
use crate::config::WhatsAppConfig;

/// WhatsApp Cloud API, plain text messages.
pub struct WhatsAppCloudGateway {
    http: Client,
    cfg: WhatsAppConfig,
}

impl WhatsAppCloudGateway {
    pub fn new(cfg: WhatsAppConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent("sendflow/whatsapp")
            .timeout(cfg.timeout)
            .build()?;
        Ok(Self { http, cfg })
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/{}/messages",
            self.cfg.base_url.trim_end_matches('/'),
            self.cfg.api_version,
            self.cfg.phone_number_id
        )
    }
}

/// Graph API error codes that mean "slow down" or "try again later"
/// even though they arrive with a 4xx status.
fn classify_graph_error(status: StatusCode, retry_after: Option<Duration>, body: String) -> GatewayError {
    let parsed = serde_json::from_str::<GraphErrorEnvelope>(&body).ok();
    let Some(err) = parsed.map(|p| p.error) else {
        return error_for_status(status, retry_after, body);
    };

    let message = format!("graph error {}: {}", err.code, err.message);
    match err.code {
        4 | 80007 | 130429 | 131048 | 131056 => GatewayError::RateLimited {
            retry_after,
            message,
        },
        // 190: expired access token. 131000/131016: provider-side trouble.
        190 | 131000 | 131016 => GatewayError::Server {
            status: status.as_u16(),
            message,
        },
        _ => error_for_status(status, retry_after, message),
    }
}

#[async_trait]
impl MessageGateway for WhatsAppCloudGateway {
    fn name(&self) -> &str {
        "whatsapp-cloud"
    }

    async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, GatewayError> {
        let payload = TextMessageRequest {
            messaging_product: "whatsapp",
            recipient_type: "individual",
            to: message.phone_number.trim().trim_start_matches('+').to_string(),
            kind: "text",
            text: TextBody {
                preview_url: false,
                body: message.body.clone(),
            },
        };

        let resp = self
            .http
            .post(self.messages_url())
            .bearer_auth(&self.cfg.access_token)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = retry_after_from(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_graph_error(status, retry_after, body));
        }

        let body: SendResponse = resp.json().await?;
        let external_message_id = body
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| GatewayError::Server {
                status: status.as_u16(),
                message: "whatsapp response contained no message id".to_string(),
            })?;

        Ok(SendReceipt {
            external_message_id,
            provider: self.name().to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct TextMessageRequest {
    messaging_product: &'static str,
    recipient_type: &'static str,
    to: String,
    #[serde(rename = "type")]
    kind: &'static str,
    text: TextBody,
}

#[derive(Debug, Serialize)]
struct TextBody {
    preview_url: bool,
    body: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GraphErrorEnvelope {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    code: i64,
    #[serde(default)]
    message: String,
}

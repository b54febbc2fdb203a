use chrono::Utc;
use serde::Serialize;
use std::time::Duration;

/// Outbound webhook endpoint plus the optional identity to post as.
#[derive(Clone, Debug, Default)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
}

impl WebhookConfig {
    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    avatar_url: Option<&'a str>,
}

/// Post a plain-text message. Delivery failure is logged and swallowed; the
/// pipeline never depends on the notification channel being up.
pub async fn post_webhook(
    client: &reqwest::Client,
    config: &WebhookConfig,
    content: &str,
    context: &str,
) -> bool {
    let Some(url) = config.url.as_deref() else {
        log::warn!("Skipping webhook post ({}): webhook URL not configured.", context);
        return false;
    };

    let payload = WebhookPayload {
        content,
        username: config.username.as_deref(),
        avatar_url: config.avatar_url.as_deref(),
    };

    let result = client
        .post(url)
        .timeout(Duration::from_secs(10))
        .json(&payload)
        .send()
        .await
        .and_then(|response| response.error_for_status());

    match result {
        Ok(_) => {
            log::info!("Posted webhook successfully ({})", context);
            true
        }
        Err(e) => {
            log::error!("Failed to post webhook ({}): {}", context, e);
            false
        }
    }
}

/// The threshold-gated consecutive-failure alert for one feed URL.
pub async fn send_failure_notification(
    client: &reqwest::Client,
    config: &WebhookConfig,
    feed_url: &str,
    failure_count: u32,
    threshold: u32,
    error_text: &str,
) {
    let content = format!(
        ":warning: GTFS poller alert\n\
         Feed: `{}`\n\
         Consecutive failures: **{}** (threshold {})\n\
         Timestamp (UTC): {}\n\
         Last error: `{}`",
        feed_url,
        failure_count,
        threshold,
        Utc::now().to_rfc3339(),
        error_text,
    );

    let posted = post_webhook(
        client,
        config,
        &content,
        &format!("failure alert for {}", feed_url),
    )
    .await;
    if posted {
        log::warn!(
            "Sent alert after {} consecutive failures for {}",
            failure_count,
            feed_url
        );
    }
}

//! Gotify push notifications.

use super::endpoint::{ensure_endpoint_path, parse_endpoint};
use super::{Message, Sender};
use crate::config::ChannelConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};
use url::Url;

/// Posts the plain-text message to a Gotify server once per application token.
#[derive(Debug)]
pub struct Gotify {
    client: reqwest::Client,
    endpoint: Url,
    tokens: Vec<String>,
    title: String,
    priority: Option<u32>,
}

impl Gotify {
    pub fn new(config: &ChannelConfig) -> Result<Self> {
        let mut endpoint = parse_endpoint("gotify", &config.endpoint, "")?;
        ensure_endpoint_path(&mut endpoint, "message");
        // Tokens come from recipients; never from a token baked into the URL.
        let kept: Vec<(String, String)> = endpoint
            .query_pairs()
            .filter(|(k, _)| k.as_ref() != "token")
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if kept.is_empty() {
            endpoint.set_query(None);
        } else {
            endpoint.query_pairs_mut().clear().extend_pairs(kept);
        }

        let tokens = config.recipient_strings();
        if tokens.is_empty() {
            bail!("gotify recipients are required");
        }
        Ok(Self {
            client: super::http::build_client(config.timeout())?,
            endpoint,
            tokens,
            title: config.title_or(super::bark::DEFAULT_TITLE),
            priority: config.priority.filter(|p| *p > 0),
        })
    }

    async fn send_one(&self, token: &str, body: &str) -> Result<()> {
        let mut form = vec![("message", body.to_string()), ("title", self.title.clone())];
        if let Some(priority) = self.priority {
            form.push(("priority", priority.to_string()));
        }
        let response = self
            .client
            .post(self.endpoint.clone())
            .query(&[("token", token)])
            .form(&form)
            .send()
            .await
            .context("sending gotify message")?;
        super::http::check_status("gotify", response).await
    }
}

#[async_trait]
impl Sender for Gotify {
    #[instrument(skip_all, fields(tokens = self.tokens.len()))]
    async fn send(&self, message: &dyn Message) -> Result<()> {
        let body = message.to_string().trim().to_string();
        if body.is_empty() {
            bail!("gotify message is required");
        }
        let mut errors = Vec::new();
        for token in &self.tokens {
            if let Err(e) = self.send_one(token, &body).await {
                errors.push(format!("{:#}", e));
            }
        }
        if !errors.is_empty() {
            bail!(errors.join("; "));
        }
        debug!("Gotify notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Recipient;
    use crate::formatting::SmsMessage;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gotify_config(endpoint: &str) -> ChannelConfig {
        ChannelConfig {
            endpoint: endpoint.to_string(),
            recipients: vec![Recipient::Name("app-token".to_string())],
            priority: Some(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_gotify_strips_token_from_endpoint() {
        let gotify = Gotify::new(&gotify_config("https://gotify.example.com/?token=leak&x=1")).unwrap();
        assert_eq!(gotify.endpoint.as_str(), "https://gotify.example.com/message?x=1");

        let gotify = Gotify::new(&gotify_config("https://gotify.example.com?token=leak")).unwrap();
        assert_eq!(gotify.endpoint.as_str(), "https://gotify.example.com/message");
    }

    #[test]
    fn test_gotify_requires_endpoint() {
        let mut config = gotify_config("");
        config.endpoint.clear();
        assert!(Gotify::new(&config).is_err());
    }

    #[tokio::test]
    async fn test_gotify_posts_form_with_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/message"))
            .and(query_param("token", "app-token"))
            .and(body_string_contains("priority=5"))
            .and(body_string_contains("hello"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let gotify = Gotify::new(&gotify_config(&server.uri())).unwrap();
        let message = SmsMessage {
            text: "hello".to_string(),
            ..Default::default()
        };

        gotify.send(&message).await.unwrap();
    }
}

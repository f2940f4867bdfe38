//! Tier 2: rendering through a remote headless-browser service.
//!
//! Talks to the browserless `/function` API. The submitted function loads the
//! page, waits for the network to go idle and returns the rendered markup
//! together with every custom property visible to the live page, including
//! ones injected by client-side code.

use super::{parse, ExtractionError, ExtractionStrategy, ExtractionTier, Fingerprint};
use crate::config::RemoteBrowserConfig;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SESSION_FUNCTION: &str = r#"export default async function ({ page, context }) {
  await page.goto(context.url, { waitUntil: "networkidle0", timeout: context.timeout });
  const html = await page.content();
  const computedVariables = await page.evaluate(() => {
    const names = new Set();
    for (const sheet of Array.from(document.styleSheets)) {
      let rules;
      try { rules = sheet.cssRules; } catch (e) { continue; }
      for (const rule of Array.from(rules)) {
        if (!rule.style) continue;
        for (const prop of Array.from(rule.style)) {
          if (prop.startsWith("--")) names.add(prop);
        }
      }
    }
    for (const prop of Array.from(getComputedStyle(document.documentElement))) {
      if (prop.startsWith("--")) names.add(prop);
    }
    return Array.from(names);
  });
  return { data: { html, computedVariables }, type: "application/json" };
}"#;

/// Extra time granted to the HTTP call on top of the in-browser timeout.
const REQUEST_GRACE: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct FunctionRequest<'a> {
    code: &'a str,
    context: FunctionContext<'a>,
}

#[derive(Serialize)]
struct FunctionContext<'a> {
    url: &'a str,
    timeout: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenderedPage {
    html: String,
    #[serde(default)]
    computed_variables: Vec<String>,
}

pub struct RemoteBrowserStrategy {
    client: Client,
    function_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl RemoteBrowserStrategy {
    pub fn new(endpoint: &str, token: Option<String>, timeout: Duration) -> Result<Self, ExtractionError> {
        let function_url = format!("{}/function", endpoint.trim_end_matches('/'));
        Url::parse(&function_url).map_err(|_| ExtractionError::InvalidUrl(endpoint.to_string()))?;
        let client = Client::builder().timeout(timeout + REQUEST_GRACE).build()?;
        Ok(Self {
            client,
            function_url,
            token,
            timeout,
        })
    }

    pub fn from_config(config: &RemoteBrowserConfig) -> Result<Self, ExtractionError> {
        Self::new(
            &config.endpoint,
            config.token.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }
}

#[async_trait]
impl ExtractionStrategy for RemoteBrowserStrategy {
    fn tier(&self) -> ExtractionTier {
        ExtractionTier::RemoteBrowser
    }

    async fn extract(&self, url: &str) -> Result<Fingerprint, ExtractionError> {
        let mut request = self.client.post(&self.function_url).json(&FunctionRequest {
            code: SESSION_FUNCTION,
            context: FunctionContext {
                url,
                timeout: self.timeout.as_millis() as u64,
            },
        });
        if let Some(token) = &self.token {
            request = request.query(&[("token", token)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::Status(status.as_u16()));
        }

        let page: RenderedPage = response.json().await?;
        if page.html.trim().is_empty() {
            return Err(ExtractionError::EmptyDocument);
        }
        debug!(
            bytes = page.html.len(),
            computed = page.computed_variables.len(),
            "Rendered document received"
        );

        let mut fingerprint = parse::analyze(&page.html);
        fingerprint.css_variables.extend(
            page.computed_variables
                .into_iter()
                .filter(|name| name.starts_with("--")),
        );
        fingerprint.extracted_via = Some(ExtractionTier::RemoteBrowser);
        Ok(fingerprint)
    }
}

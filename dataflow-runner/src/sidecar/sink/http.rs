//! HTTP sink.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::sidecar::sink::Sink;
use dataflow_core::connector::HttpSink as HttpSinkSpec;
use dataflow_core::meta::Meta;

pub struct HttpSink {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl HttpSink {
    /// Create a new instance.
    pub fn new(name: &str, spec: &HttpSinkSpec) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(spec.insecure_skip_verify)
            .build()
            .context("error building http sink client")?;
        Ok(Self {
            name: name.to_string(),
            url: spec.url.clone(),
            client,
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn sink(&self, meta: &Meta, data: &[u8]) -> Result<()> {
        let mut headers = http::HeaderMap::new();
        meta.inject(&mut headers)?;
        let resp = self
            .client
            .post(&self.url)
            .headers(headers)
            .body(data.to_vec())
            .send()
            .await
            .with_context(|| format!("error posting message to {}", self.url))?;
        if !resp.status().is_success() {
            bail!("http sink {} returned {}", self.url, resp.status());
        }
        Ok(())
    }
}

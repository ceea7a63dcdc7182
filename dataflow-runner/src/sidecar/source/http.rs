//! HTTP source.
//!
//! Messages arrive as `POST /sources/<name>` on the sidecar server, guarded
//! by a bearer token stored in the step-scoped secret. The adapter itself
//! holds no connection; the server routes to its handler.

use anyhow::Result;
use async_trait::async_trait;

use crate::sidecar::source::{Process, Source};

/// A connected HTTP source.
pub struct HttpSource {
    name: String,
}

/// The request handler the sidecar server routes `POST /sources/<name>` to.
#[derive(Clone)]
pub struct HttpSourceHandler {
    /// The source URN used for metadata of inbound messages.
    pub urn: String,
    /// The expected value of the `Authorization` header.
    pub authorization: String,
    /// The process callback, already wrapped in the retry engine.
    pub process: Process,
}

impl HttpSource {
    /// Create a new instance along with its route handler.
    pub fn new(name: &str, urn: &str, token: String, process: Process) -> (Self, HttpSourceHandler) {
        let handler = HttpSourceHandler {
            urn: urn.to_string(),
            authorization: format!("Bearer {}", token),
            process,
        };
        (Self { name: name.to_string() }, handler)
    }
}

#[async_trait]
impl Source for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> Result<()> {
        // The route stays registered; closing the server stops ingress.
        Ok(())
    }
}

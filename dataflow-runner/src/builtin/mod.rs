//! Built-in processors.
//!
//! These run as the pod's main container, speaking the loopback contract:
//! an HTTP server on the fixed main port (`/ready`, `POST /messages`), with
//! results POSTed back to the sidecar's `/messages` endpoint carrying the
//! originating message's metadata headers.

mod dedupe;
mod group;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::body::Bytes;
use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::{routing::get, routing::post, AddExtensionLayer, Router};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::SignalStream;
use tokio_stream::StreamMap;

use crate::config::Config;
use dataflow_core::crd::Processor as ProcessorSpec;
use dataflow_core::expr::{self, Env, Value};
use dataflow_core::meta::Meta;
use dataflow_core::{PATH_GROUPS, PORT_MAIN, PORT_SIDECAR};

/// A message processor: one message in, zero or more messages out.
pub trait Processor: Send + Sync {
    fn process(&self, meta: &Meta, msg: &[u8]) -> Result<Vec<Vec<u8>>>;
}

/// The expression environment of one message.
pub(crate) fn expr_env(meta: &Meta, msg: &[u8]) -> Env {
    let mut env = Env::new();
    env.insert("msg".into(), Value::Bytes(msg.to_vec()));
    env.insert("source".into(), Value::Str(meta.source.clone()));
    env.insert("id".into(), Value::Str(meta.id.clone()));
    env.insert("time".into(), Value::Str(meta.time.to_rfc3339()));
    env
}

struct CatProcessor;

impl Processor for CatProcessor {
    fn process(&self, _meta: &Meta, msg: &[u8]) -> Result<Vec<Vec<u8>>> {
        Ok(vec![msg.to_vec()])
    }
}

struct MapProcessor {
    program: String,
}

impl Processor for MapProcessor {
    fn process(&self, meta: &Meta, msg: &[u8]) -> Result<Vec<Vec<u8>>> {
        let out = expr::eval_bytes(&self.program, &expr_env(meta, msg))?;
        Ok(vec![out])
    }
}

struct FilterProcessor {
    program: String,
}

impl Processor for FilterProcessor {
    fn process(&self, meta: &Meta, msg: &[u8]) -> Result<Vec<Vec<u8>>> {
        if expr::eval_bool(&self.program, &expr_env(meta, msg))? {
            Ok(vec![msg.to_vec()])
        } else {
            Ok(vec![])
        }
    }
}

pub async fn run(config: Arc<Config>, kind: &str) -> Result<()> {
    let step = config.step()?;
    let processor: Arc<dyn Processor> = match (&step.spec.processor, kind) {
        (ProcessorSpec::Cat(_), "cat") => Arc::new(CatProcessor),
        (ProcessorSpec::Map(program), "map") => Arc::new(MapProcessor { program: program.clone() }),
        (ProcessorSpec::Filter(program), "filter") => Arc::new(FilterProcessor { program: program.clone() }),
        (ProcessorSpec::Dedupe(spec), "dedupe") => dedupe::Dedupe::spawn(spec.clone(), config.update_interval()?),
        (ProcessorSpec::Group(spec), "group") => Arc::new(group::Group::new(spec.clone(), PATH_GROUPS)?),
        (processor, kind) => bail!("step processor {:?} does not match runner role {:?}", processor, kind),
    };
    serve(processor).await
}

struct BuiltinState {
    processor: Arc<dyn Processor>,
    client: reqwest::Client,
    sidecar_url: String,
}

/// Serve the loopback contract until SIGTERM.
async fn serve(processor: Arc<dyn Processor>) -> Result<()> {
    let state = Arc::new(BuiltinState {
        processor,
        client: reqwest::Client::new(),
        sidecar_url: format!("http://localhost:{}/messages", PORT_SIDECAR),
    });
    let app = Router::new()
        .route("/ready", get(ready))
        .route("/messages", post(messages))
        .layer(AddExtensionLayer::new(state));

    let mut signals = StreamMap::new();
    signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
    signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

    let server = axum::Server::bind(&([0, 0, 0, 0], PORT_MAIN).into())
        .serve(app.into_make_service())
        .with_graceful_shutdown(async move {
            let _sig = signals.next().await;
            tracing::info!("signal received, shutting down");
        });
    tracing::info!("processor is listening at 0.0.0.0:{}", PORT_MAIN);
    server.await.context("error serving loopback interface")?;
    Ok(())
}

async fn ready() -> StatusCode {
    StatusCode::OK
}

async fn messages(Extension(state): Extension<Arc<BuiltinState>>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let meta = match Meta::extract(&headers) {
        Ok(meta) => meta,
        Err(err) => {
            tracing::error!(error = ?err, "message arrived without metadata");
            return StatusCode::BAD_REQUEST;
        }
    };
    let outputs = match state.processor.process(&meta, &body) {
        Ok(outputs) => outputs,
        Err(err) => {
            tracing::error!(error = ?err, "failed to process message");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };
    for output in outputs {
        let mut out_headers = http::HeaderMap::new();
        if let Err(err) = meta.inject(&mut out_headers) {
            tracing::error!(error = ?err, "failed to build message headers");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
        let res = state
            .client
            .post(&state.sidecar_url)
            .headers(out_headers)
            .body(output)
            .send()
            .await;
        match res {
            Ok(resp) if resp.status().is_success() => (),
            Ok(resp) => {
                tracing::error!(status = %resp.status(), "sidecar rejected message");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
            Err(err) => {
                tracing::error!(error = ?err, "failed to post message to sidecar");
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        }
    }
    StatusCode::OK
}

#[cfg(test)]
mod test {
    use super::*;

    fn meta_fixture() -> Meta {
        Meta::new("urn:dataflow:http:test", "id-1", chrono::Utc::now())
    }

    #[test]
    fn cat_passes_through() -> Result<()> {
        let out = CatProcessor.process(&meta_fixture(), b"foo-bar")?;
        assert_eq!(out, vec![b"foo-bar".to_vec()]);
        Ok(())
    }

    #[test]
    fn map_transforms_the_message() -> Result<()> {
        let map = MapProcessor {
            program: "bytes('hi! ' + string(msg))".into(),
        };
        let out = map.process(&meta_fixture(), b"foo-bar")?;
        assert_eq!(out, vec![b"hi! foo-bar".to_vec()]);
        Ok(())
    }

    #[test]
    fn filter_keeps_matches_only() -> Result<()> {
        let filter = FilterProcessor {
            program: "string(msg) == 'accept'".into(),
        };
        assert_eq!(filter.process(&meta_fixture(), b"accept")?, vec![b"accept".to_vec()]);
        assert!(filter.process(&meta_fixture(), b"deny")?.is_empty());
        Ok(())
    }

    #[test]
    fn expressions_see_metadata_vars() -> Result<()> {
        let filter = FilterProcessor {
            program: "id == 'id-1'".into(),
        };
        assert_eq!(filter.process(&meta_fixture(), b"x")?.len(), 1);
        Ok(())
    }

    #[test]
    fn map_errors_surface() {
        let map = MapProcessor {
            program: "unknown_fn(msg)".into(),
        };
        assert!(map.process(&meta_fixture(), b"x").is_err());
    }
}

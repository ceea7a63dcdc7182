//! Bridges between the sidecar & the user container.
//!
//! Ingress carries source messages into the main container, either down the
//! `in` FIFO as newline-delimited JSON envelopes, or as loopback HTTP POSTs
//! once the container reports ready. Egress carries results back: a scanner
//! over the `out` FIFO, plus the `POST /messages` route on the sidecar
//! server; both feed the fan-out sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::sidecar::sink::FanOutSink;
use dataflow_core::crd::{Processor, StepSpec};
use dataflow_core::meta::{Envelope, Meta};
use dataflow_core::{PATH_FIFO_IN, PATH_FIFO_OUT, PORT_MAIN};

/// The interval between readiness probes of the main container.
const READY_PROBE_INTERVAL: Duration = Duration::from_secs(3);

/// The URN attached to egress messages which arrive without metadata.
const URN_FIFO_OUT: &str = "urn:dataflow:fifo:out";

/// The ingress bridge into the user container.
pub enum MainBridge {
    /// Writes JSON envelope lines down the `in` FIFO.
    Fifo(Mutex<tokio::fs::File>),
    /// POSTs messages to the container's loopback endpoint.
    Http(reqwest::Client, String),
}

impl MainBridge {
    /// Connect to the main container.
    ///
    /// The HTTP bridge blocks until the container's `/ready` endpoint
    /// responds, probing on a fixed interval.
    pub async fn connect(spec: &StepSpec) -> Result<Self> {
        let use_fifo = matches!(&spec.processor, Processor::Container(container) if container.fifo);
        if use_fifo {
            let fifo = tokio::fs::OpenOptions::new()
                .write(true)
                .open(PATH_FIFO_IN)
                .await
                .context("error opening input FIFO")?;
            tracing::info!("opened input FIFO");
            return Ok(MainBridge::Fifo(Mutex::new(fifo)));
        }

        let client = reqwest::Client::new();
        let base = format!("http://localhost:{}", PORT_MAIN);
        tracing::info!("waiting for HTTP in interface to be ready");
        loop {
            match client.get(format!("{}/ready", base)).send().await {
                Ok(resp) if resp.status().is_success() => break,
                _ => tokio::time::sleep(READY_PROBE_INTERVAL).await,
            }
        }
        tracing::info!("HTTP in interface ready");
        Ok(MainBridge::Http(client, base))
    }

    /// Deliver one message to the main container.
    pub async fn send(&self, meta: &Meta, data: &[u8]) -> Result<()> {
        match self {
            MainBridge::Fifo(fifo) => {
                let line = serde_json::to_vec(&Envelope::new(meta.clone(), data)).context("error encoding envelope")?;
                let mut fifo = fifo.lock().await;
                fifo.write_all(&line).await.context("error writing message to input FIFO")?;
                fifo.write_all(b"\n").await.context("error writing newline to input FIFO")?;
                fifo.flush().await.context("error flushing input FIFO")?;
                Ok(())
            }
            MainBridge::Http(client, base) => {
                let mut headers = http::HeaderMap::new();
                meta.inject(&mut headers)?;
                let resp = client
                    .post(format!("{}/messages", base))
                    .headers(headers)
                    .body(data.to_vec())
                    .send()
                    .await
                    .context("error posting message to main container")?;
                if !resp.status().is_success() {
                    bail!("main container returned {}", resp.status());
                }
                Ok(())
            }
        }
    }
}

/// Spawn the egress FIFO scanner.
///
/// Lines are decoded as JSON envelopes when possible, and otherwise treated
/// as raw payloads from containers which do not speak the envelope format.
/// An unrecoverable I/O or sink error is fatal for the replica.
pub fn spawn_fifo_egress(fan_out: Arc<FanOutSink>, fatal: Arc<AtomicBool>, shutdown_tx: broadcast::Sender<()>) -> JoinHandle<()> {
    let mut shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let res = async {
            loop {
                // Opening the read end blocks until a writer appears; EOF
                // after the writer closes loops back around to reopen.
                let fifo = tokio::fs::OpenOptions::new()
                    .read(true)
                    .open(PATH_FIFO_OUT)
                    .await
                    .context("error opening output FIFO")?;
                tracing::info!("opened output FIFO");
                let mut lines = BufReader::new(fifo).lines();
                loop {
                    let line = tokio::select! {
                        line = lines.next_line() => line.context("error reading from output FIFO")?,
                        _ = shutdown.recv() => return Ok(()),
                    };
                    let line = match line {
                        Some(line) => line,
                        None => break, // EOF; reopen.
                    };
                    let (meta, data) = decode_egress_line(&line)?;
                    fan_out
                        .sink(&meta, &data)
                        .await
                        .context("error writing FIFO message to sinks")?;
                }
            }
        }
        .await;
        if let Err(err) = res {
            let err: anyhow::Error = err;
            tracing::error!(error = ?err, "egress FIFO failed");
            fatal.store(true, Ordering::SeqCst);
            let _res = shutdown_tx.send(());
        }
    })
}

/// Decode a line read from the output FIFO.
pub fn decode_egress_line(line: &str) -> Result<(Meta, Vec<u8>)> {
    if line.trim_start().starts_with('{') {
        if let Ok(envelope) = serde_json::from_str::<Envelope>(line) {
            let data = envelope.data()?;
            return Ok((envelope.meta, data));
        }
    }
    let meta = Meta::new(URN_FIFO_OUT, uuid::Uuid::new_v4().to_string(), chrono::Utc::now());
    Ok((meta, line.as_bytes().to_vec()))
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn envelope_lines_preserve_meta() -> Result<()> {
        let meta = Meta::new("urn:dataflow:kafka:b:t", "0-7", chrono::Utc.ymd(2021, 9, 1).and_hms(0, 0, 0));
        let line = serde_json::to_string(&Envelope::new(meta.clone(), b"payload"))?;
        let (decoded, data) = decode_egress_line(&line)?;
        assert_eq!(decoded, meta);
        assert_eq!(data, b"payload");
        Ok(())
    }

    #[test]
    fn raw_lines_get_fresh_meta() -> Result<()> {
        let (meta, data) = decode_egress_line("hello world")?;
        assert_eq!(meta.source, URN_FIFO_OUT);
        assert_eq!(data, b"hello world");
        Ok(())
    }

    #[test]
    fn non_envelope_json_is_passed_through_raw() -> Result<()> {
        let (_meta, data) = decode_egress_line(r#"{"some":"json"}"#)?;
        assert_eq!(data, br#"{"some":"json"}"#.to_vec());
        Ok(())
    }
}

//! Dedupe processor.
//!
//! Drops messages whose uniqueness key has been seen recently. The key set
//! is bounded: a GC loop trims the oldest keys down to `max_size` every
//! update interval (with jitter), so a key re-appearing after the window is
//! forwarded again. At-least-once semantics upstream make this best-effort
//! by construction.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use rand::Rng;

use crate::builtin::{expr_env, Processor};
use dataflow_core::crd::DedupeSpec;
use dataflow_core::expr;
use dataflow_core::meta::Meta;

const METRIC_DUPLICATES: &str = "dataflow_dedupe_duplicates";

#[derive(Default)]
struct Inner {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

pub struct Dedupe {
    uid: String,
    max_size: usize,
    inner: Mutex<Inner>,
}

impl Dedupe {
    /// Create a new instance & start its GC loop.
    pub fn spawn(spec: DedupeSpec, gc_interval: Duration) -> Arc<Self> {
        metrics::register_counter!(METRIC_DUPLICATES, metrics::Unit::Count, "messages dropped as duplicates");
        let dedupe = Arc::new(Self::new(spec));
        let gc_target = dedupe.clone();
        tokio::spawn(async move {
            loop {
                let spread = rand::thread_rng().gen_range(0.0..=0.2);
                tokio::time::sleep(gc_interval.mul_f64(1.0 + spread)).await;
                gc_target.gc();
            }
        });
        dedupe
    }

    fn new(spec: DedupeSpec) -> Self {
        Self {
            uid: spec.uid,
            max_size: spec.max_size as usize,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Trim the oldest keys down to the configured bound.
    fn gc(&self) {
        let mut inner = self.inner.lock().expect("dedupe mutex poisoned");
        while inner.order.len() > self.max_size {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
    }
}

impl Processor for Dedupe {
    fn process(&self, meta: &Meta, msg: &[u8]) -> Result<Vec<Vec<u8>>> {
        let key = expr::eval_str(&self.uid, &expr_env(meta, msg))?;
        let mut inner = self.inner.lock().expect("dedupe mutex poisoned");
        if inner.seen.contains(&key) {
            metrics::counter!(METRIC_DUPLICATES, 1);
            tracing::debug!(key = %key, "dropping duplicate message");
            return Ok(vec![]);
        }
        inner.seen.insert(key.clone());
        inner.order.push_back(key);
        Ok(vec![msg.to_vec()])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn dedupe_with_max(max_size: u64) -> Dedupe {
        Dedupe::new(DedupeSpec {
            uid: "string(msg)".into(),
            max_size,
        })
    }

    fn meta_fixture() -> Meta {
        Meta::new("urn:dataflow:http:test", "id", chrono::Utc::now())
    }

    #[test]
    fn duplicates_are_dropped() -> Result<()> {
        let dedupe = dedupe_with_max(100);
        let meta = meta_fixture();
        assert_eq!(dedupe.process(&meta, b"foo")?.len(), 1);
        assert_eq!(dedupe.process(&meta, b"foo")?.len(), 0);
        assert_eq!(dedupe.process(&meta, b"bar")?.len(), 1);
        Ok(())
    }

    #[test]
    fn gc_forgets_the_oldest_keys() -> Result<()> {
        // Mirrors a two-key window: after GC, the two newest keys survive.
        let dedupe = dedupe_with_max(2);
        let meta = meta_fixture();
        let mut forwarded = 0;
        for msg in [&b"foo"[..], b"bar", b"baz"] {
            forwarded += dedupe.process(&meta, msg)?.len();
        }
        dedupe.gc();
        for msg in [&b"foo"[..], b"baz", b"baz"] {
            forwarded += dedupe.process(&meta, msg)?.len();
        }
        assert_eq!(forwarded, 4, "expected 4 of 6 messages forwarded, 2 dropped as duplicates");
        Ok(())
    }

    #[test]
    fn gc_is_a_noop_under_the_bound() -> Result<()> {
        let dedupe = dedupe_with_max(10);
        let meta = meta_fixture();
        dedupe.process(&meta, b"foo")?;
        dedupe.gc();
        assert_eq!(dedupe.process(&meta, b"foo")?.len(), 0, "key under the bound must survive GC");
        Ok(())
    }

    #[test]
    fn default_uid_hashes_the_payload() -> Result<()> {
        let dedupe = Dedupe::new(DedupeSpec {
            uid: "sha256(msg)".into(),
            max_size: 10,
        });
        let meta = meta_fixture();
        assert_eq!(dedupe.process(&meta, b"x")?.len(), 1);
        assert_eq!(dedupe.process(&meta, b"x")?.len(), 0);
        Ok(())
    }
}

//! Pre-stop hooks.
//!
//! Sources & sinks register close hooks at startup; on shutdown they run in
//! LIFO registration order, so sources (registered last) close first and stop
//! ingress before the sinks are torn down.

use futures::future::BoxFuture;
use tokio::sync::Mutex;

type Hook = (String, BoxFuture<'static, anyhow::Result<()>>);

/// A LIFO registry of pre-stop hooks.
#[derive(Default)]
pub struct PreStopHooks {
    hooks: Mutex<Vec<Hook>>,
}

impl PreStopHooks {
    /// Register a hook; hooks run in reverse registration order.
    pub async fn push(&self, name: impl Into<String>, hook: BoxFuture<'static, anyhow::Result<()>>) {
        self.hooks.lock().await.push((name.into(), hook));
    }

    /// Run all registered hooks in LIFO order.
    ///
    /// Hooks run at most once; concurrent & repeated calls find an empty registry.
    pub async fn run(&self) {
        loop {
            let hook = { self.hooks.lock().await.pop() };
            let (name, hook) = match hook {
                Some(hook) => hook,
                None => return,
            };
            tracing::info!(hook = %name, "running pre-stop hook");
            if let Err(err) = hook.await {
                tracing::error!(error = ?err, hook = %name, "error running pre-stop hook");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    #[tokio::test]
    async fn hooks_run_lifo_and_once() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let hooks = PreStopHooks::default();
        for name in ["first", "second", "third"] {
            let order = order.clone();
            hooks
                .push(name, Box::pin(async move {
                    order.lock().unwrap().push(name);
                    Ok(())
                }))
                .await;
        }
        hooks.run().await;
        assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);

        hooks.run().await;
        assert_eq!(order.lock().unwrap().len(), 3, "hooks must not run twice");
    }
}

//! Progress barriers over port sessions.
//!
//! A barrier waits until one port, or a set of ports, reaches 100 %
//! readiness. There is no internal timeout by default; the operating
//! assumption is "wait forever, the physical device will eventually
//! answer", but an optional cap exists so tests cannot deadlock. Every
//! observed progress change is published keyed by port id.

use crate::error::{EngineError, EngineResult};
use crate::publish::{EngineEvent, EventPublisher};
use crate::session::SessionHandle;
use std::time::Duration;
use tracing::debug;

/// Wait for one session to reach 100 %, publishing every progress change.
pub async fn await_ready(
    handle: &SessionHandle,
    publisher: &dyn EventPublisher,
    cap: Option<Duration>,
) -> EngineResult<f64> {
    match cap {
        None => wait_full(handle, publisher).await,
        Some(cap) => tokio::time::timeout(cap, wait_full(handle, publisher))
            .await
            .map_err(|_| EngineError::BarrierTimeout {
                port: handle.port_index,
                progress: handle.current_progress(),
            })?,
    }
}

async fn wait_full(handle: &SessionHandle, publisher: &dyn EventPublisher) -> EngineResult<f64> {
    let mut progress = handle.progress.clone();
    publisher.publish(EngineEvent::InitProgress {
        port: handle.port_index,
        progress: *progress.borrow(),
    });
    loop {
        let current = *progress.borrow();
        if current >= 100.0 {
            debug!(port = handle.port_index, "barrier released");
            return Ok(current);
        }
        if progress.changed().await.is_err() {
            // Session task ended; the final value decides.
            let last = *progress.borrow();
            if last >= 100.0 {
                return Ok(last);
            }
            return Err(EngineError::BarrierTimeout {
                port: handle.port_index,
                progress: last,
            });
        }
        publisher.publish(EngineEvent::InitProgress {
            port: handle.port_index,
            progress: *progress.borrow(),
        });
    }
}

/// Wait for every session in the set; resolves when all are at 100 %.
pub async fn await_all(
    handles: &[SessionHandle],
    publisher: &dyn EventPublisher,
    cap: Option<Duration>,
) -> EngineResult<()> {
    let waits = handles
        .iter()
        .map(|handle| await_ready(handle, publisher, cap));
    futures::future::try_join_all(waits).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::NullPublisher;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};
    use tokio::sync::watch;

    fn handle_with(progress: f64) -> (watch::Sender<f64>, SessionHandle) {
        let (tx, rx) = watch::channel(progress);
        (
            tx,
            SessionHandle {
                port_index: 2,
                progress: rx,
                captures: Arc::new(Mutex::new(BTreeMap::new())),
            },
        )
    }

    #[tokio::test]
    async fn resolves_when_progress_hits_full() {
        let (tx, handle) = handle_with(40.0);
        let waiter = tokio::spawn(async move {
            await_ready(&handle, &NullPublisher, Some(Duration::from_secs(2))).await
        });

        tx.send(70.0).expect("send");
        tx.send(100.0).expect("send");

        let progress = waiter.await.expect("join").expect("barrier");
        assert_eq!(progress, 100.0);
    }

    #[tokio::test]
    async fn cap_produces_timeout_error() {
        let (_tx, handle) = handle_with(10.0);
        let result = await_ready(&handle, &NullPublisher, Some(Duration::from_millis(50))).await;
        match result {
            Err(EngineError::BarrierTimeout { port, progress }) => {
                assert_eq!(port, 2);
                assert_eq!(progress, 10.0);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn already_complete_resolves_immediately() {
        let (_tx, handle) = handle_with(100.0);
        let progress = await_ready(&handle, &NullPublisher, None)
            .await
            .expect("barrier");
        assert_eq!(progress, 100.0);
    }
}

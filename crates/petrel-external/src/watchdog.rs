//! Ping/pong watchdog for the external channel.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::endpoint::ExternalEndpoint;
use crate::error::EndpointError;

/// Posts a PING every `interval` and declares the worker unresponsive
/// once no PONG has been observed within `timeout`.
///
/// Runs until the endpoint's cancellation token fires or the staleness
/// threshold trips the error funnel.
pub(crate) async fn run(
    endpoint: ExternalEndpoint,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let stale = {
            let st = endpoint.inner().state.lock().await;
            if st.stopped {
                return;
            }
            st.last_pong.is_some_and(|at| at.elapsed() > timeout)
        };

        if stale {
            endpoint
                .trigger_error(&EndpointError::WorkerUnresponsive.to_string())
                .await;
            return;
        }

        endpoint.send_ping().await;
    }
}

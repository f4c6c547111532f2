use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};
use tracing::{trace, warn};

use super::{ControlTransport, HandshakeError};
use crate::control::ControlClient;

/// Shortest keepalive period; shorter requests are raised to this.
pub const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(10);

/// Sends `OPTIONS *` every `interval` until a request fails.
///
/// The transport is expected to bound each request with a timeout, so a
/// silent receiver surfaces as [`HandshakeError::Timeout`]. The first failure
/// is handed to `on_failure` and the task ends. Non-2xx answers still prove
/// the receiver is alive and are only logged.
pub async fn run_keepalive<T, F>(
    mut transport: T,
    control: ControlClient,
    interval: Duration,
    on_failure: F,
) where
    T: ControlTransport + Send,
    F: FnOnce(HandshakeError) + Send,
{
    let mut ticker = time::interval(interval.max(MIN_KEEPALIVE_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the session was just negotiated.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match control.send(&mut transport, control.options()).await {
            Ok(resp) if resp.is_success() => trace!("keepalive ok"),
            Ok(resp) => warn!(status = resp.status, "keepalive answered with error status"),
            Err(err) => {
                warn!(error = %err, "keepalive failed");
                on_failure(err);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::oneshot;

    use crate::messages::{RtspRequest, RtspResponse};

    /// Answers `ok_count` requests, then times out.
    struct Flaky {
        ok_count: usize,
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ControlTransport for Flaky {
        async fn request(&mut self, req: RtspRequest) -> Result<RtspResponse, HandshakeError> {
            let n = self.seen.fetch_add(1, Ordering::SeqCst);
            if n < self.ok_count {
                Ok(RtspResponse::new(200, "OK").header("CSeq", req.cseq().unwrap_or(0).to_string()))
            } else {
                Err(HandshakeError::Timeout("OPTIONS response".into()))
            }
        }
    }

    #[tokio::test]
    async fn reports_first_failure_once() {
        let seen = Arc::new(AtomicUsize::new(0));
        let control = ControlClient::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "test",
        );
        let (tx, rx) = oneshot::channel();
        run_keepalive(
            Flaky {
                ok_count: 2,
                seen: seen.clone(),
            },
            control,
            Duration::from_millis(5),
            move |err| {
                let _ = tx.send(err);
            },
        )
        .await;

        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert!(matches!(rx.await.unwrap(), HandshakeError::Timeout(_)));
    }

    #[tokio::test]
    async fn zero_interval_still_reports_failure() {
        let seen = Arc::new(AtomicUsize::new(0));
        let control = ControlClient::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            "test",
        );
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(run_keepalive(
            Flaky {
                ok_count: 1,
                seen: seen.clone(),
            },
            control,
            Duration::ZERO,
            move |err| {
                let _ = tx.send(err);
            },
        ));

        let err = time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, HandshakeError::Timeout(_)));
        task.await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}

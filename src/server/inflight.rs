use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Work that must finish before shutdown completes.
///
/// Client connections and tunnel splices are counted separately because they
/// have different lifetimes: a CONNECT request is answered with 200 and its
/// connection upgraded long before the detached splice task stops moving
/// bytes. Draining on connections alone would let the process exit while
/// tunnels are still live, so the drain waits on both.
#[derive(Debug, Default)]
pub struct InFlight {
    connections: AtomicI64,
    tunnels: AtomicI64,
}

#[derive(Clone, Copy)]
enum Work {
    Connection,
    Tunnel,
}

/// RAII handle: the tracked work counts until the guard drops.
pub struct InFlightGuard {
    registry: Arc<InFlight>,
    work: Work,
}

impl InFlight {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track one downstream connection for its serve lifetime.
    pub fn track_connection(self: &Arc<Self>) -> InFlightGuard {
        self.connections.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!("proxy_connections_active").increment(1.0);
        InFlightGuard {
            registry: self.clone(),
            work: Work::Connection,
        }
    }

    /// Track one tunnel splice; held by the splice task, not the request.
    pub fn track_tunnel(self: &Arc<Self>) -> InFlightGuard {
        self.tunnels.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!("proxy_tunnels_active").increment(1.0);
        InFlightGuard {
            registry: self.clone(),
            work: Work::Tunnel,
        }
    }

    pub fn connections(&self) -> i64 {
        self.connections.load(Ordering::Acquire)
    }

    pub fn tunnels(&self) -> i64 {
        self.tunnels.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.connections() == 0 && self.tunnels() == 0
    }

    /// Wait until all tracked work has finished, up to `deadline`. Returns
    /// `true` when fully drained, `false` when the deadline expired first.
    pub async fn drain(&self, deadline: Duration) -> bool {
        const POLL: Duration = Duration::from_millis(200);
        let expires = tokio::time::Instant::now() + deadline;
        loop {
            if self.is_idle() {
                return true;
            }
            if tokio::time::Instant::now() >= expires {
                return false;
            }
            tokio::time::sleep(POLL).await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        match self.work {
            Work::Connection => {
                self.registry.connections.fetch_sub(1, Ordering::AcqRel);
                metrics::gauge!("proxy_connections_active").decrement(1.0);
            }
            Work::Tunnel => {
                self.registry.tunnels.fetch_sub(1, Ordering::AcqRel);
                metrics::gauge!("proxy_tunnels_active").decrement(1.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_count_their_own_kind() {
        let in_flight = InFlight::new();
        let c1 = in_flight.track_connection();
        let c2 = in_flight.track_connection();
        let t1 = in_flight.track_tunnel();
        assert_eq!(in_flight.connections(), 2);
        assert_eq!(in_flight.tunnels(), 1);
        assert!(!in_flight.is_idle());

        drop(c1);
        assert_eq!(in_flight.connections(), 1);
        assert_eq!(in_flight.tunnels(), 1);

        drop(c2);
        drop(t1);
        assert!(in_flight.is_idle());
    }

    #[tokio::test]
    async fn test_drain_returns_immediately_when_idle() {
        let in_flight = InFlight::new();
        assert!(in_flight.drain(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_drain_times_out_while_tunnel_open() {
        let in_flight = InFlight::new();
        let _splice = in_flight.track_tunnel();
        assert!(!in_flight.drain(Duration::from_millis(50)).await);
        assert_eq!(in_flight.tunnels(), 1);
    }

    #[tokio::test]
    async fn test_drain_completes_when_work_finishes() {
        let in_flight = InFlight::new();
        let guard = in_flight.track_tunnel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });
        assert!(in_flight.drain(Duration::from_secs(5)).await);
        assert!(in_flight.is_idle());
    }
}

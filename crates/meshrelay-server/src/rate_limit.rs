//! Per-IP sliding-window rate limiting in front of every route.
//!
//! Each client keeps the instants of its requests inside the current
//! window. A request is admitted while fewer than `limit` are recorded;
//! rejected requests are not recorded, so a client hammering the relay
//! regains access as soon as its oldest admitted request ages out.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Rejected; a slot frees up after this long.
    Limited { retry_after: Duration },
}

#[derive(Clone)]
pub struct RateLimiter {
    clients: Arc<Mutex<HashMap<IpAddr, VecDeque<Instant>>>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    /// At most `limit` requests per client within any `window`.
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            limit,
            window,
        }
    }

    pub async fn check(&self, ip: IpAddr) -> Admission {
        self.check_at(ip, Instant::now()).await
    }

    async fn check_at(&self, ip: IpAddr, now: Instant) -> Admission {
        let mut clients = self.clients.lock().await;
        let recent = clients.entry(ip).or_default();

        while let Some(&oldest) = recent.front() {
            if now.saturating_duration_since(oldest) < self.window {
                break;
            }
            recent.pop_front();
        }

        if recent.len() < self.limit {
            recent.push_back(now);
            return Admission::Allowed;
        }

        let retry_after = recent
            .front()
            .map(|&oldest| (oldest + self.window).saturating_duration_since(now))
            .unwrap_or(self.window);
        Admission::Limited { retry_after }
    }

    /// Forget clients with no admitted request in the last `max_idle`.
    pub async fn purge_stale(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|_, recent| {
            recent
                .back()
                .is_some_and(|&last| now.saturating_duration_since(last) < max_idle)
        });
        before - clients.len()
    }

    pub fn spawn_purge(&self, every: Duration, max_idle: Duration) -> JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let purged = limiter.purge_stale(max_idle).await;
                if purged > 0 {
                    debug!(purged, "Purged idle rate-limit clients");
                }
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(300, Duration::from_secs(30))
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(ip) = client_ip(&req) {
        if let Admission::Limited { retry_after } = limiter.check(ip).await {
            // Whole seconds, rounded up so a client never retries early.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            warn!(ip = %ip, path = %req.uri().path(), retry_after = secs, "Rate limit exceeded");
            let mut resp = StatusCode::TOO_MANY_REQUESTS.into_response();
            resp.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
            return resp;
        }
    }

    next.run(req).await
}

/// ConnectInfo first, then X-Forwarded-For, then X-Real-IP.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip());
    }

    let header_ip = |name: &str| {
        req.headers()
            .get(name)?
            .to_str()
            .ok()?
            .split(',')
            .next()?
            .trim()
            .parse::<IpAddr>()
            .ok()
    };
    header_ip("x-forwarded-for").or_else(|| header_ip("x-real-ip"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_limit_within_window() {
        let limiter = RateLimiter::new(3, WINDOW);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let start = Instant::now();

        for i in 0..3 {
            let at = start + Duration::from_secs(i);
            assert_eq!(limiter.check_at(ip, at).await, Admission::Allowed);
        }
        assert_eq!(
            limiter.check_at(ip, start + Duration::from_secs(4)).await,
            Admission::Limited {
                retry_after: Duration::from_secs(6)
            }
        );
    }

    #[tokio::test]
    async fn test_oldest_request_ages_out() {
        let limiter = RateLimiter::new(2, WINDOW);
        let ip: IpAddr = "10.1.1.1".parse().unwrap();
        let start = Instant::now();

        assert_eq!(limiter.check_at(ip, start).await, Admission::Allowed);
        let second = start + Duration::from_secs(5);
        assert_eq!(limiter.check_at(ip, second).await, Admission::Allowed);
        assert!(matches!(
            limiter.check_at(ip, start + Duration::from_secs(9)).await,
            Admission::Limited { .. }
        ));

        // First request leaves the window; the rejected one was never counted.
        assert_eq!(limiter.check_at(ip, start + WINDOW).await, Admission::Allowed);
        assert!(matches!(
            limiter.check_at(ip, start + WINDOW).await,
            Admission::Limited { retry_after } if retry_after == Duration::from_secs(5)
        ));
    }

    #[tokio::test]
    async fn test_clients_are_per_ip() {
        let limiter = RateLimiter::new(2, WINDOW);
        let ip1: IpAddr = "10.0.0.1".parse().unwrap();
        let ip2: IpAddr = "10.0.0.2".parse().unwrap();

        assert_eq!(limiter.check(ip1).await, Admission::Allowed);
        assert_eq!(limiter.check(ip1).await, Admission::Allowed);
        assert!(matches!(limiter.check(ip1).await, Admission::Limited { .. }));
        assert_eq!(limiter.check(ip2).await, Admission::Allowed);
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let limiter = RateLimiter::new(5, WINDOW);
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert_eq!(limiter.check(ip).await, Admission::Allowed);

        assert_eq!(limiter.purge_stale(Duration::from_secs(600)).await, 0);
        assert_eq!(limiter.purge_stale(Duration::ZERO).await, 1);
        assert!(limiter.clients.lock().await.is_empty());
    }

    #[test]
    fn test_client_ip_from_headers() {
        let req = Request::builder()
            .header("x-forwarded-for", "198.51.100.4, 10.0.0.1")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&req), "198.51.100.4".parse().ok());

        let req = Request::builder()
            .header("x-real-ip", "198.51.100.9")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&req), "198.51.100.9".parse().ok());

        let req = Request::builder().body(()).unwrap();
        assert_eq!(client_ip(&req), None);
    }
}

//! Per-connection session loop
//!
//! Re-creates a bidirectional byte pipe over strictly alternating HTTP
//! exchanges: read whatever the local socket has (bounded by the current
//! poll interval), POST it, stream the response back into the socket,
//! adapt the poll interval, repeat. Requests of one session never overlap,
//! which is what keeps byte order intact in both directions for the
//! tunneled protocol.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};

use crate::config::MeekConfig;
use crate::cookie::make_cookie;
use crate::dns::DnsResolver;
use crate::protect::SocketProtector;
use crate::transport::{MEEK_SERVER_TIMEOUT, SessionTransport};
use crate::{MeekError, MeekResult};

pub(crate) const MAX_PAYLOAD_LENGTH: usize = 0x10000;
pub(crate) const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
pub(crate) const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub(crate) const MAX_POLL_INTERVAL: Duration = Duration::from_millis(5000);
const POLL_INTERVAL_MULTIPLIER: f64 = 1.5;

/// A local read that overruns its timeout by this much means the device
/// slept through it rather than merely being idle.
const SLEEP_SKEW_GRACE: Duration = Duration::from_millis(1000);

/// The relay drops server-side session state after roughly twice its
/// request timeout without traffic.
pub(crate) const SESSION_EXPIRY: Duration =
    Duration::from_millis(2 * MEEK_SERVER_TIMEOUT.as_millis() as u64);

/// Adaptive delay between polls.
///
/// While bytes flow the loop polls as fast as it can to approximate
/// streaming; once idle it backs off geometrically to a ceiling that still
/// keeps the relay session alive.
#[derive(Debug)]
pub(crate) struct PollInterval {
    current: Duration,
}

impl PollInterval {
    pub(crate) fn new() -> Self {
        Self {
            current: MIN_POLL_INTERVAL,
        }
    }

    pub(crate) fn current(&self) -> Duration {
        self.current
    }

    /// Adjust after a successful exchange.
    pub(crate) fn on_exchange(&mut self, sent_data: bool, received_data: bool) {
        self.current = if sent_data || received_data {
            MIN_POLL_INTERVAL
        } else if self.current == MIN_POLL_INTERVAL {
            IDLE_POLL_INTERVAL
        } else {
            self.current
                .mul_f64(POLL_INTERVAL_MULTIPLIER)
                .min(MAX_POLL_INTERVAL)
        };
    }
}

pub(crate) fn session_expired(last_success: Option<Instant>, now: Instant) -> bool {
    match last_success {
        Some(at) => now.duration_since(at) > SESSION_EXPIRY,
        None => false,
    }
}

fn read_overran(expected: Duration, actual: Duration) -> bool {
    actual > expected + SLEEP_SKEW_GRACE
}

#[derive(Default)]
struct SessionStats {
    requests: u64,
    uploaded: u64,
    downloaded: u64,
}

/// Tunnel one accepted local connection until EOF or failure.
pub(crate) async fn run_session(
    stream: TcpStream,
    config: Arc<MeekConfig>,
    protector: Arc<dyn SocketProtector>,
    resolver: Arc<dyn DnsResolver>,
) -> MeekResult<()> {
    let mut stats = SessionStats::default();
    let result = drive(stream, config, protector, resolver, &mut stats).await;
    log::info!(
        "Meek: session ended (requests: {}, uploaded: {} bytes, downloaded: {} bytes)",
        stats.requests,
        stats.uploaded,
        stats.downloaded
    );
    result
}

async fn drive(
    stream: TcpStream,
    config: Arc<MeekConfig>,
    protector: Arc<dyn SocketProtector>,
    resolver: Arc<dyn DnsResolver>,
    stats: &mut SessionStats,
) -> MeekResult<()> {
    // Computed once; the relay correlates the session's requests by it
    let cookie = make_cookie(&config)?;
    let mut transport = SessionTransport::new(config, protector, resolver);

    let (mut local_reader, mut local_writer) = stream.into_split();
    let mut payload_buf = vec![0u8; MAX_PAYLOAD_LENGTH];
    let mut poll_interval = PollInterval::new();
    let mut last_success: Option<Instant> = None;

    loop {
        // TODO: read in a separate task so uploads can continue while a
        // long download streams
        let mut payload_len = 0usize;
        let read_started = Instant::now();
        match timeout(poll_interval.current(), local_reader.read(&mut payload_buf)).await {
            Ok(Ok(0)) => return Ok(()), // EOF, clean shutdown
            Ok(Ok(n)) => payload_len = n,
            Ok(Err(e)) => return Err(MeekError::LocalIo(e.to_string())),
            Err(_) => {
                // Nothing to upload; this iteration polls with an empty
                // body. A read that blocked far past its timeout means the
                // device slept through it.
                let read_duration = read_started.elapsed();
                if read_overran(poll_interval.current(), read_duration) {
                    log::warn!(
                        "Meek: local read took {} ms (expected {} ms)",
                        read_duration.as_millis(),
                        poll_interval.current().as_millis()
                    );
                    if session_expired(last_success, Instant::now()) {
                        // Don't issue requests while reads still misbehave;
                        // the pre-request check below ends the session once
                        // they recover.
                        continue;
                    }
                }
            }
        }

        // After a long enough gap the relay has expired this session and
        // will answer every poll with an empty 200 while no data flows.
        if session_expired(last_success, Instant::now()) {
            log::warn!(
                "Meek: no successful request in over {} ms, closing session",
                SESSION_EXPIRY.as_millis()
            );
            return Ok(());
        }

        // One retry, which is only safe because a failed attempt is a
        // whole-request failure: the relay commits payload solely on
        // complete receipt, and replayed bytes would corrupt the tunneled
        // stream.
        let mut outcome = None;
        for attempt in 0..2 {
            match transport
                .exchange(&cookie, &payload_buf[..payload_len], &mut local_writer)
                .await
            {
                Ok(downloaded) => {
                    outcome = Some(downloaded);
                    break;
                }
                // Downstream bytes may already have reached the local
                // socket; retrying would deliver them twice
                Err(MeekError::LocalIo(e)) => return Err(MeekError::LocalIo(e)),
                Err(e) => {
                    log::warn!("Meek: request attempt {} failed: {}", attempt + 1, e);
                }
            }
        }
        let Some(downloaded) = outcome else {
            return Err(MeekError::Http("request failed after retry".to_string()));
        };

        last_success = Some(Instant::now());
        stats.requests += 1;
        stats.uploaded += payload_len as u64;
        stats.downloaded += downloaded;

        poll_interval.on_exchange(payload_len > 0, downloaded > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_interval_idle_progression() {
        let mut interval = PollInterval::new();
        assert_eq!(interval.current(), MIN_POLL_INTERVAL);

        let mut observed = Vec::new();
        for _ in 0..12 {
            interval.on_exchange(false, false);
            observed.push(interval.current().as_millis());
        }

        assert_eq!(
            observed,
            vec![100, 150, 225, 337, 506, 759, 1139, 1708, 2562, 3844, 5000, 5000]
        );
    }

    #[test]
    fn test_poll_interval_resets_on_upload() {
        let mut interval = PollInterval::new();
        for _ in 0..5 {
            interval.on_exchange(false, false);
        }
        interval.on_exchange(true, false);
        assert_eq!(interval.current(), MIN_POLL_INTERVAL);
    }

    #[test]
    fn test_poll_interval_resets_on_download() {
        let mut interval = PollInterval::new();
        for _ in 0..5 {
            interval.on_exchange(false, false);
        }
        interval.on_exchange(false, true);
        assert_eq!(interval.current(), MIN_POLL_INTERVAL);
    }

    #[test]
    fn test_poll_interval_stays_at_min_while_active() {
        let mut interval = PollInterval::new();
        for _ in 0..10 {
            interval.on_exchange(true, true);
            assert_eq!(interval.current(), MIN_POLL_INTERVAL);
        }
    }

    #[test]
    fn test_poll_interval_never_leaves_bounds() {
        let mut interval = PollInterval::new();
        for step in 0..100 {
            interval.on_exchange(step % 17 == 0, false);
            assert!(interval.current() >= MIN_POLL_INTERVAL);
            assert!(interval.current() <= MAX_POLL_INTERVAL);
        }
    }

    #[test]
    fn test_session_expired_without_success_never_fires() {
        let now = Instant::now();
        assert!(!session_expired(None, now));
    }

    #[test]
    fn test_session_expired_boundaries() {
        let start = Instant::now();
        let just_inside = start + SESSION_EXPIRY;
        let just_past = start + SESSION_EXPIRY + Duration::from_millis(1);

        assert!(!session_expired(Some(start), just_inside));
        assert!(session_expired(Some(start), just_past));
    }

    #[test]
    fn test_session_expired_after_clock_jump() {
        // A 45 s jump with a 40 s budget must end the session
        let start = Instant::now();
        let after_sleep = start + Duration::from_secs(45);
        assert!(session_expired(Some(start), after_sleep));
    }

    #[test]
    fn test_read_overran_needs_a_full_second() {
        let interval = Duration::from_millis(100);
        assert!(!read_overran(interval, Duration::from_millis(1099)));
        assert!(read_overran(interval, Duration::from_millis(1102)));
    }
}

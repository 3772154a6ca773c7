use std::net::SocketAddr;

use tokio::time::{self, Duration};

use super::dialer::{Dial, DialResult};

/// Attempt plan for one target: how often to retry, how the backoff grows,
/// and which protocol versions to offer in order.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    pub protocol_versions: Vec<i32>,
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub connection_timeout: Duration,
    pub extended_timeout: Duration,
}

/// Wraps a dialer with retries and protocol fallback.
///
/// Every attempt walks the protocol-version list: a handshake that fails on
/// a working TCP connection may simply need an older version, so the next
/// version is tried on the same attempt, while a dead TCP target skips
/// straight to the next backoff. The best classification seen anywhere is
/// what comes out (`Unreachable < Reachable < Up`).
pub struct RetryStrategy<D> {
    dial: D,
    schedule: RetrySchedule,
}

impl<D: Dial> RetryStrategy<D> {
    pub fn new(dial: D, schedule: RetrySchedule) -> Self {
        RetryStrategy { dial, schedule }
    }

    pub async fn dial_with_retry(&self, addr: SocketAddr) -> DialResult {
        let attempts = self.schedule.max_retries + 1;
        let mut best = DialResult::Unreachable;
        let mut last_was_reachable = false;

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self
                    .schedule
                    .initial_delay
                    .mul_f64(self.schedule.backoff_multiplier.powi(attempt as i32 - 1));
                log::debug!(
                    "retrying {addr} after {:.1}s backoff (attempt {}/{attempts})",
                    delay.as_secs_f64(),
                    attempt + 1
                );
                time::sleep(delay).await;
            }

            for (fallback_index, &protocol_version) in
                self.schedule.protocol_versions.iter().enumerate()
            {
                if fallback_index > 0 {
                    log::debug!("trying fallback protocol {protocol_version} against {addr}");
                }

                // a node that accepted TCP before gets more patience
                let timeout = if attempt > 0 && last_was_reachable {
                    self.schedule.extended_timeout
                } else {
                    self.schedule.connection_timeout
                };

                match self.dial.try_dial(addr, protocol_version, timeout).await {
                    up @ DialResult::Up(_) => {
                        if attempt > 0 || fallback_index > 0 {
                            log::info!(
                                "connected to {addr} after retry/fallback \
                                 (attempt {}, protocol {protocol_version})",
                                attempt + 1
                            );
                        }
                        return up;
                    }
                    reachable @ DialResult::Reachable { .. } => {
                        last_was_reachable = true;
                        promote(&mut best, reachable);
                    }
                    DialResult::Unreachable => {
                        // TCP itself failed; other protocol versions will
                        // fare no better on this attempt
                        last_was_reachable = false;
                        break;
                    }
                }
            }
        }

        match &best {
            DialResult::Reachable { .. } => {
                log::debug!("{addr} reachable but the handshake never completed ({attempts} attempts)")
            }
            _ => log::debug!("{addr} unreachable after {attempts} attempts"),
        }
        best
    }
}

/// Classifications only ever improve; an equal rank takes the newer result
/// so the reported latency is the most recent observation.
fn promote(best: &mut DialResult, candidate: DialResult) {
    if candidate.rank() >= best.rank() {
        *best = candidate;
    }
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::super::dialer::ProbeInfo;
    use super::*;

    fn target() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 5)), 8333)
    }

    fn up() -> DialResult {
        DialResult::Up(Box::new(ProbeInfo {
            protocol_version: 70015,
            services: 1,
            start_height: 100,
            user_agent: "/Satoshi:25.0.0/".to_string(),
            latency_ms: 12.0,
            peers: vec![],
        }))
    }

    struct CallRecord {
        protocol_version: i32,
        timeout: Duration,
    }

    /// Plays back a fixed list of results and records what it was asked.
    struct ScriptedDialer {
        script: Mutex<Vec<DialResult>>,
        calls: Mutex<Vec<CallRecord>>,
    }

    impl ScriptedDialer {
        fn new(script: Vec<DialResult>) -> Self {
            let mut script = script;
            script.reverse();
            ScriptedDialer {
                script: Mutex::new(script),
                calls: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl Dial for ScriptedDialer {
        async fn try_dial(
            &self,
            _addr: SocketAddr,
            protocol_version: i32,
            timeout: Duration,
        ) -> DialResult {
            self.calls.lock().unwrap().push(CallRecord {
                protocol_version,
                timeout,
            });
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(DialResult::Unreachable)
        }
    }

    fn schedule(protocol_versions: Vec<i32>, max_retries: u32) -> RetrySchedule {
        RetrySchedule {
            protocol_versions,
            max_retries,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            connection_timeout: Duration::from_secs(5),
            extended_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn up_returns_immediately() {
        let strategy = RetryStrategy::new(ScriptedDialer::new(vec![up()]), schedule(vec![70016], 3));
        let result = strategy.dial_with_retry(target()).await;
        assert!(matches!(result, DialResult::Up(_)));
        assert_eq!(strategy.dial.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn protocol_fallback_rescues_the_first_attempt() {
        // handshake fails on the primary version, succeeds on the fallback
        let strategy = RetryStrategy::new(
            ScriptedDialer::new(vec![DialResult::Reachable { latency_ms: 3.0 }, up()]),
            schedule(vec![70016, 70015], 3),
        );

        let result = strategy.dial_with_retry(target()).await;
        assert!(matches!(result, DialResult::Up(_)));

        let calls = strategy.dial.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].protocol_version, 70016);
        assert_eq!(calls[1].protocol_version, 70015);
    }

    #[tokio::test]
    async fn unreachable_skips_remaining_fallbacks() {
        let strategy = RetryStrategy::new(
            ScriptedDialer::new(vec![
                DialResult::Unreachable,
                DialResult::Unreachable,
            ]),
            schedule(vec![70016, 70015], 1),
        );

        let result = strategy.dial_with_retry(target()).await;
        assert!(matches!(result, DialResult::Unreachable));

        // one call per attempt: no fallback after a dead TCP target
        let calls = strategy.dial.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|call| call.protocol_version == 70016));
    }

    #[tokio::test]
    async fn reachable_survives_a_later_unreachable() {
        let strategy = RetryStrategy::new(
            ScriptedDialer::new(vec![
                DialResult::Reachable { latency_ms: 8.0 },
                DialResult::Unreachable,
            ]),
            schedule(vec![70016], 1),
        );

        let result = strategy.dial_with_retry(target()).await;
        match result {
            DialResult::Reachable { latency_ms } => assert_eq!(latency_ms, 8.0),
            other => panic!("expected the reachable classification to stick, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reachable_targets_get_the_extended_timeout_on_retry() {
        let strategy = RetryStrategy::new(
            ScriptedDialer::new(vec![
                DialResult::Reachable { latency_ms: 5.0 },
                DialResult::Reachable { latency_ms: 6.0 },
            ]),
            schedule(vec![70016], 1),
        );

        strategy.dial_with_retry(target()).await;

        let calls = strategy.dial.calls.lock().unwrap();
        assert_eq!(calls[0].timeout, Duration::from_secs(5));
        assert_eq!(calls[1].timeout, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_exponentially() {
        let strategy = RetryStrategy::new(
            ScriptedDialer::new(vec![]),
            RetrySchedule {
                protocol_versions: vec![70016],
                max_retries: 3,
                initial_delay: Duration::from_secs(1),
                backoff_multiplier: 2.0,
                connection_timeout: Duration::from_secs(5),
                extended_timeout: Duration::from_secs(10),
            },
        );

        let started = Instant::now();
        strategy.dial_with_retry(target()).await;
        // 1s + 2s + 4s of backoff across the three retries
        assert!(started.elapsed() >= Duration::from_secs(7));
    }
}

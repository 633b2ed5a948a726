//! Staggered race of the two best candidates.
//!
//! The primary leg starts immediately. The secondary leg starts once the
//! hedge delay elapses, or right away if the primary fails first; it is never
//! constructed when the primary succeeds within the delay. The first success
//! wins and the other leg is cancelled and dropped, which releases its
//! admission slot through the executor's normal exit path.

use crate::error::FetchError;
use crate::executor::Payload;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome of one leg, labelled with the proxy that served it (or the one
/// that was requested, if admission failed).
#[derive(Debug)]
pub struct AttemptReport {
    pub proxy: String,
    pub result: Result<Payload, FetchError>,
}

/// Result of a hedged race.
#[derive(Debug)]
pub enum HedgeOutcome {
    Won { proxy: String, payload: Payload },
    BothFailed { failures: Vec<(String, FetchError)> },
}

/// Races a primary and a delayed secondary attempt.
#[derive(Debug, Clone, Copy)]
pub struct HedgeController {
    delay: Duration,
}

impl HedgeController {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// Runs the race. Each leg receives its own child of `parent`.
    pub async fn race<P, PF, S, SF>(
        &self,
        parent: &CancellationToken,
        primary: P,
        secondary: S,
    ) -> HedgeOutcome
    where
        P: FnOnce(CancellationToken) -> PF,
        PF: Future<Output = AttemptReport>,
        S: FnOnce(CancellationToken) -> SF,
        SF: Future<Output = AttemptReport>,
    {
        let primary_token = parent.child_token();
        let secondary_token = parent.child_token();
        let mut failures = Vec::with_capacity(2);

        let primary = primary(primary_token.clone());
        tokio::pin!(primary);
        let delay = tokio::time::sleep(self.delay);
        tokio::pin!(delay);

        let early = tokio::select! {
            biased;
            report = &mut primary => Some(report),
            _ = &mut delay => None,
        };

        if let Some(report) = early {
            match report.result {
                Ok(payload) => {
                    debug!(proxy = %report.proxy, "Primary won before hedge delay");
                    return HedgeOutcome::Won {
                        proxy: report.proxy,
                        payload,
                    };
                }
                Err(e) => {
                    debug!(proxy = %report.proxy, error = %e, "Primary failed early, starting secondary");
                    failures.push((report.proxy, e));
                }
            }

            let report = secondary(secondary_token).await;
            return match report.result {
                Ok(payload) => HedgeOutcome::Won {
                    proxy: report.proxy,
                    payload,
                },
                Err(e) => {
                    failures.push((report.proxy, e));
                    HedgeOutcome::BothFailed { failures }
                }
            };
        }

        debug!(delay_ms = self.delay.as_millis() as u64, "Primary still pending, starting secondary");
        let secondary = secondary(secondary_token.clone());
        tokio::pin!(secondary);

        let mut primary_done = false;
        let mut secondary_done = false;
        loop {
            tokio::select! {
                report = &mut primary, if !primary_done => {
                    primary_done = true;
                    match report.result {
                        Ok(payload) => {
                            secondary_token.cancel();
                            return HedgeOutcome::Won { proxy: report.proxy, payload };
                        }
                        Err(e) => failures.push((report.proxy, e)),
                    }
                }
                report = &mut secondary, if !secondary_done => {
                    secondary_done = true;
                    match report.result {
                        Ok(payload) => {
                            primary_token.cancel();
                            return HedgeOutcome::Won { proxy: report.proxy, payload };
                        }
                        Err(e) => failures.push((report.proxy, e)),
                    }
                }
            }

            if primary_done && secondary_done {
                return HedgeOutcome::BothFailed { failures };
            }
        }
    }
}

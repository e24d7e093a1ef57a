use reqwest::blocking::Client;
use reqwest::redirect::Policy;
use serde::Serialize;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{HostConfig, ReadinessConfig};
use crate::docker::{running_containers, DockerRunner};
use crate::probe::workload_running;

/// One bounded wait: a predicate polled at a fixed interval.
pub struct ReadinessCheck<'a> {
    predicate: Box<dyn FnMut(u32) -> bool + 'a>,
    interval: Duration,
    max_attempts: NonZeroU32,
}

impl<'a> ReadinessCheck<'a> {
    pub fn new(
        predicate: impl FnMut(u32) -> bool + 'a,
        interval: Duration,
        max_attempts: NonZeroU32,
    ) -> Self {
        Self {
            predicate: Box::new(predicate),
            interval,
            max_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReadinessOutcome {
    Ready { attempts: u32 },
    Timeout { attempts: u32 },
    /// Interrupt flag observed between attempts.
    Cancelled { attempts: u32 },
}

#[derive(Default)]
pub struct ReadinessWaiter {
    cancel: Option<Arc<AtomicBool>>,
}

impl ReadinessWaiter {
    pub fn new(cancel: Option<Arc<AtomicBool>>) -> Self {
        Self { cancel }
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Evaluates the predicate at most `max_attempts` times, sleeping between
    /// attempts only. Never exits the process; the caller decides fatality.
    pub fn wait(&self, mut check: ReadinessCheck<'_>) -> ReadinessOutcome {
        let max = check.max_attempts.get();
        for attempt in 1..=max {
            if (check.predicate)(attempt) {
                info!(attempt, "workload ready");
                return ReadinessOutcome::Ready { attempts: attempt };
            }
            debug!(attempt, max, "workload not ready yet");
            if attempt == max {
                break;
            }
            if self.cancelled() {
                return ReadinessOutcome::Cancelled { attempts: attempt };
            }
            thread::sleep(check.interval);
        }
        warn!(attempts = max, "workload did not become ready");
        ReadinessOutcome::Timeout { attempts: max }
    }
}

/// HTTP probe against the local endpoint. Redirects are not followed so a
/// redirect to the TLS listener counts as a live service.
pub struct HttpProbe {
    client: Option<Client>,
    url: String,
    success_codes: Vec<u16>,
}

impl HttpProbe {
    pub fn new(url: &str, success_codes: &[u16]) -> Self {
        let client = Client::builder()
            .redirect(Policy::none())
            .danger_accept_invalid_certs(true)
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| warn!(error = %err, "could not build HTTP client"))
            .ok();
        Self {
            client,
            url: url.to_string(),
            success_codes: success_codes.to_vec(),
        }
    }

    pub fn check(&self) -> bool {
        let Some(client) = &self.client else {
            return false;
        };
        match client.get(&self.url).send() {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!(url = %self.url, status, "readiness probe response");
                self.success_codes.contains(&status)
            }
            Err(err) => {
                debug!(url = %self.url, error = %err, "readiness probe failed");
                false
            }
        }
    }
}

/// Containers up, plus the HTTP endpoint answering when one is configured.
pub fn workload_check<'a, R: DockerRunner>(
    runner: &'a R,
    host: &'a HostConfig,
    readiness: &'a ReadinessConfig,
) -> ReadinessCheck<'a> {
    let http = (!readiness.http_url.trim().is_empty())
        .then(|| HttpProbe::new(&readiness.http_url, &readiness.success_codes));
    let cwd: PathBuf = host.install_root();
    let predicate = move |_attempt: u32| {
        let names = match running_containers(runner, &host.container_filter, &cwd) {
            Ok(names) => names,
            Err(err) => {
                debug!(error = %err, "container listing failed");
                return false;
            }
        };
        if !workload_running(&names, &readiness.expected_containers) {
            return false;
        }
        http.as_ref().map(HttpProbe::check).unwrap_or(true)
    };
    ReadinessCheck::new(
        predicate,
        Duration::from_secs(readiness.interval_sec),
        NonZeroU32::new(readiness.max_attempts).unwrap_or(NonZeroU32::MIN),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::tests::MockDockerRunner;
    use std::cell::Cell;

    fn attempts(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[test]
    fn never_ready_stops_after_max_attempts() {
        let evaluations = Cell::new(0u32);
        let check = ReadinessCheck::new(
            |_| {
                evaluations.set(evaluations.get() + 1);
                false
            },
            Duration::ZERO,
            attempts(3),
        );
        let outcome = ReadinessWaiter::default().wait(check);
        assert_eq!(outcome, ReadinessOutcome::Timeout { attempts: 3 });
        assert_eq!(evaluations.get(), 3);
    }

    #[test]
    fn ready_on_first_success() {
        let check = ReadinessCheck::new(|attempt| attempt == 2, Duration::ZERO, attempts(5));
        assert_eq!(
            ReadinessWaiter::default().wait(check),
            ReadinessOutcome::Ready { attempts: 2 }
        );
    }

    #[test]
    fn cancellation_is_checked_between_attempts() {
        let flag = Arc::new(AtomicBool::new(true));
        let evaluations = Cell::new(0u32);
        let check = ReadinessCheck::new(
            |_| {
                evaluations.set(evaluations.get() + 1);
                false
            },
            Duration::ZERO,
            attempts(10),
        );
        let outcome = ReadinessWaiter::new(Some(flag)).wait(check);
        assert_eq!(outcome, ReadinessOutcome::Cancelled { attempts: 1 });
        assert_eq!(evaluations.get(), 1);
    }

    #[test]
    fn workload_check_polls_container_list() {
        let runner = MockDockerRunner::default();
        runner.push_ps("");
        runner.push_ps("");
        runner.set_ps_default("bitwarden-web\n");
        let host = HostConfig::default();
        let readiness = ReadinessConfig {
            interval_sec: 0,
            max_attempts: 5,
            http_url: String::new(),
            ..ReadinessConfig::default()
        };
        let outcome = ReadinessWaiter::default().wait(workload_check(&runner, &host, &readiness));
        assert_eq!(outcome, ReadinessOutcome::Ready { attempts: 3 });
        assert_eq!(runner.count("ps"), 3);
    }

    #[test]
    fn http_probe_fails_closed_when_unreachable() {
        let probe = HttpProbe::new("http://127.0.0.1:9/", &[200]);
        assert!(!probe.check());
    }
}

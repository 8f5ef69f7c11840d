//! Event system for the client.
//!
//! Provides hooks for metrics, logging, and custom reactions around pipeline
//! and challenge-cycle activity.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::metrics::MetricsCollector;
use crate::challenges::state::ChallengePhase;

/// Request about to hit the transport.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub url: Url,
    pub method: Method,
    pub authorized: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub url: Url,
    pub method: Method,
    pub status: u16,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

/// A realm's state machine changed phase.
#[derive(Debug, Clone)]
pub struct ChallengeEvent {
    pub realm: String,
    pub cycle: u64,
    pub phase: ChallengePhase,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ParkedEvent {
    pub realm: String,
    pub queued: usize,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of draining a realm's queue after a successful cycle.
#[derive(Debug, Clone)]
pub struct ReplayEvent {
    pub realm: String,
    pub replayed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub timestamp: DateTime<Utc>,
}

/// Parked requests rejected after a failed cycle.
#[derive(Debug, Clone)]
pub struct RejectEvent {
    pub realm: String,
    pub count: usize,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub host: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Request(RequestEvent),
    Response(ResponseEvent),
    Challenge(ChallengeEvent),
    Parked(ParkedEvent),
    Replay(ReplayEvent),
    Reject(RejectEvent),
    Error(ErrorEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ClientEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: ClientEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &ClientEvent) {
        match event {
            ClientEvent::Request(request) => {
                log::debug!(
                    "-> {} {}{}",
                    request.method,
                    request.url,
                    if request.authorized { " (authorized)" } else { "" }
                );
            }
            ClientEvent::Response(response) => {
                log::debug!(
                    "<- {} {} -> {} ({:.2}s)",
                    response.method,
                    response.url,
                    response.status,
                    response.latency.as_secs_f64()
                );
            }
            ClientEvent::Challenge(challenge) => match &challenge.detail {
                Some(detail) => log::info!(
                    "realm '{}' cycle {} -> {} ({detail})",
                    challenge.realm,
                    challenge.cycle,
                    challenge.phase
                ),
                None => log::info!(
                    "realm '{}' cycle {} -> {}",
                    challenge.realm,
                    challenge.cycle,
                    challenge.phase
                ),
            },
            ClientEvent::Parked(parked) => {
                log::debug!("parked request on realm '{}' ({} queued)", parked.realm, parked.queued);
            }
            ClientEvent::Replay(replay) => {
                log::info!(
                    "realm '{}' replayed {} request(s), {} skipped, {} failed",
                    replay.realm,
                    replay.replayed,
                    replay.skipped,
                    replay.failed
                );
            }
            ClientEvent::Reject(reject) => {
                log::warn!(
                    "realm '{}' rejected {} parked request(s): {}",
                    reject.realm,
                    reject.count,
                    reject.reason
                );
            }
            ClientEvent::Error(error) => {
                log::warn!("warning {} -> {}", error.host, error.error);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &ClientEvent) {
        match event {
            ClientEvent::Response(response) => {
                self.metrics.record_response(
                    response.url.host_str().unwrap_or(""),
                    response.status,
                    response.latency,
                );
            }
            ClientEvent::Error(error) => {
                self.metrics.record_error(&error.host);
            }
            ClientEvent::Challenge(challenge) => match challenge.phase {
                ChallengePhase::Challenged => self.metrics.record_cycle_started(&challenge.realm),
                ChallengePhase::Succeeded => {
                    self.metrics.record_cycle_finished(&challenge.realm, true)
                }
                ChallengePhase::Failed => {
                    self.metrics.record_cycle_finished(&challenge.realm, false)
                }
                ChallengePhase::Idle | ChallengePhase::Submitting => {}
            },
            ClientEvent::Parked(parked) => self.metrics.record_parked(&parked.realm),
            ClientEvent::Replay(replay) => {
                self.metrics.record_replayed(&replay.realm, replay.replayed);
                self.metrics.record_rejected(&replay.realm, replay.failed);
            }
            ClientEvent::Reject(reject) => self.metrics.record_rejected(&reject.realm, reject.count),
            ClientEvent::Request(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &ClientEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.dispatch(ClientEvent::Error(ErrorEvent {
            host: "mfp.example.com".into(),
            error: "timeout".into(),
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[test]
    fn metrics_handler_counts_cycles() {
        let metrics = MetricsCollector::new();
        let handler = MetricsHandler::new(metrics.clone());
        for phase in [ChallengePhase::Challenged, ChallengePhase::Submitting, ChallengePhase::Failed] {
            handler.handle(&ClientEvent::Challenge(ChallengeEvent {
                realm: "AuthRealm".into(),
                cycle: 1,
                phase,
                detail: None,
                timestamp: Utc::now(),
            }));
        }
        handler.handle(&ClientEvent::Reject(RejectEvent {
            realm: "AuthRealm".into(),
            count: 3,
            reason: "bad creds".into(),
            timestamp: Utc::now(),
        }));

        let snapshot = metrics.snapshot();
        let stats = snapshot.realm("AuthRealm").unwrap();
        assert_eq!(stats.cycles_started, 1);
        assert_eq!(stats.cycles_failed, 1);
        assert_eq!(stats.requests_rejected, 3);
    }
}

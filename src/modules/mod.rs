//! Cross-cutting services: structured events and metrics.

pub mod events;
pub mod metrics;

pub use events::{
    ChallengeEvent, ClientEvent, ErrorEvent, EventDispatcher, EventHandler, LoggingHandler,
    MetricsHandler, ParkedEvent, RejectEvent, ReplayEvent, RequestEvent, ResponseEvent,
};
pub use metrics::{GlobalStats, HostStats, MetricsCollector, MetricsSnapshot, RealmStats};

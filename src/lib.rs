//! Proctor Telemetry - real-time monitoring pipeline for proctored sessions.
//!
//! Producers sample (or react to) candidate behavior and emit timestamped
//! events, a reconnecting WebSocket transport ships them to a relay, and
//! observers fold the stream into a live feed and a running risk score.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Proctor Telemetry                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐                                             │
//! │  │    Gaze     │──┐                         ┌─────────────┐  │
//! │  └─────────────┘  │   ┌─────────────┐   ┌──▶│  LiveFeed   │  │
//! │  ┌─────────────┐  ├──▶│  Transport  │───┤   └─────────────┘  │
//! │  │    Audio    │──┤   │ (reconnect) │   │   ┌─────────────┐  │
//! │  └─────────────┘  │   └─────────────┘   └──▶│ RiskLedger  │  │
//! │  ┌─────────────┐  │                         └─────────────┘  │
//! │  │   Screen    │──┘                                          │
//! │  └─────────────┘                                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use proctor_telemetry::{feed::LiveFeed, risk::RiskLedger, Event, EventType};
//! use serde_json::json;
//!
//! let mut feed = LiveFeed::default();
//! let mut ledger = RiskLedger::default();
//!
//! let event = Event::new(EventType::Screen, "S-1", 0, json!({"trigger": "tab_change"}));
//! let assessment = ledger.record(&event);
//! feed.ingest(event);
//! println!("{} -> {}", assessment.score, assessment.status);
//! ```

pub mod config;
pub mod event;
pub mod feed;
pub mod producer;
pub mod risk;
pub mod stats;
pub mod transport;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError};
pub use event::{Event, EventType, WireMessage};
pub use feed::{describe, FeedFilter, LiveFeed};
pub use producer::{
    AnalysisProducer, AudioAnalyzer, EventSink, GazeAnalyzer, ScreenMonitor, ScreenTrigger,
};
pub use risk::{PatternWeights, RiskAssessment, RiskLedger, RiskStatus, RiskThresholds};
pub use stats::{PipelineStats, SharedStats};
pub use transport::{
    ConnectionState, Endpoint, Transport, TransportConfig, TransportNotice, WsConnector,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}

//! Offline demonstration of the monitoring pipeline.
//!
//! This example shows how to:
//! 1. Run seeded gaze and audio producers
//! 2. Feed screen triggers to a screen monitor
//! 3. Collect everything into a live feed
//! 4. Score the session with a risk ledger
//!
//! Run with: cargo run --example feed_demo
//!
//! No network connection is needed.

use std::sync::Arc;
use std::time::Duration;

use proctor_telemetry::{
    describe,
    producer::{seeded_rng, SharedSink},
    AnalysisProducer, AudioAnalyzer, Event, FeedFilter, GazeAnalyzer, LiveFeed, RiskLedger,
    RiskStatus, ScreenMonitor, ScreenTrigger,
};

const SESSION: &str = "DEMO-1";

#[tokio::main]
async fn main() {
    println!("Proctor Telemetry - Feed Demo");
    println!("=============================");
    println!();

    let (tx, rx) = crossbeam_channel::bounded::<Event>(1024);
    let sink: SharedSink = Arc::new(tx);

    let mut gaze = AnalysisProducer::new(
        GazeAnalyzer::new(),
        SESSION,
        Duration::from_millis(200),
        sink.clone(),
        seeded_rng(Some(42)),
    );
    let mut audio = AnalysisProducer::new(
        AudioAnalyzer::new(),
        SESSION,
        Duration::from_millis(400),
        sink.clone(),
        seeded_rng(Some(43)),
    );
    let mut screen = ScreenMonitor::new(SESSION, sink);

    println!("Running producers for 2 seconds...");
    gaze.start();
    audio.start();
    screen.start();

    for line in ["tab hidden", "tab visible", "key ctrl+c", "paste", "blur"] {
        tokio::time::sleep(Duration::from_millis(300)).await;
        match line.parse::<ScreenTrigger>() {
            Ok(trigger) => {
                screen.observe(trigger);
            }
            Err(e) => eprintln!("{e}"),
        }
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    gaze.stop();
    audio.stop();
    screen.stop();

    let mut feed = LiveFeed::default();
    let mut ledger = RiskLedger::default();
    let mut peak = RiskStatus::Normal;

    for event in rx.try_iter() {
        let assessment = ledger.record(&event);
        peak = peak.max(assessment.status);
        feed.ingest(event);
    }

    println!();
    println!("Events collected: {}", feed.total_ingested());
    println!();
    println!("Most recent screen activity:");
    feed.set_filter(FeedFilter::Only(proctor_telemetry::EventType::Screen));
    for event in feed.presented().take(5) {
        println!("  {}", describe(event));
    }

    feed.set_filter(FeedFilter::All);
    println!();
    println!("Most recent events:");
    for event in feed.presented().take(10) {
        println!("  [{}] {}", event.timestamp(), describe(event));
    }

    println!();
    println!(
        "Final score: {} ({}), peak status {}",
        ledger.score(SESSION),
        ledger.status(SESSION),
        peak
    );
}

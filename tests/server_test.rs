//! Integration tests for the relay server

#[cfg(feature = "server")]
mod server_tests {
    use proctor_telemetry::event::{Event, EventType, SCORE_UPDATE_TYPE};
    use proctor_telemetry::risk::RiskThresholds;
    use proctor_telemetry::server::{run, ServerConfig};
    use proctor_telemetry::transport::{
        Endpoint, Transport, TransportChannels, TransportConfig, TransportNotice, WsConnector,
    };
    use serde_json::json;
    use std::net::SocketAddr;
    use std::time::Duration;

    async fn start() -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
        let config = ServerConfig::new(0, RiskThresholds::default(), Duration::from_secs(10));
        let (addr, shutdown_tx) = run(config).await.expect("Failed to start server");

        // Give server time to start
        tokio::time::sleep(Duration::from_millis(100)).await;
        (addr, shutdown_tx)
    }

    async fn open(addr: SocketAddr, endpoint: Endpoint) -> (Transport, TransportChannels) {
        let (transport, channels) = Transport::spawn(
            WsConnector::default(),
            &format!("ws://{}/ws", addr),
            endpoint,
            TransportConfig::default(),
        );
        transport.connect();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !transport.is_connected() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Failed to connect");
        (transport, channels)
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (addr, shutdown_tx) = start().await;

        let client = reqwest::Client::new();
        let response = client
            .get(format!("http://{}/health", addr))
            .send()
            .await
            .expect("Failed to send request");

        assert!(response.status().is_success());

        let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
        assert_eq!(body["status"], "ok");
        assert!(body["version"].as_str().is_some());

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_relay_round_trip() {
        let (addr, shutdown_tx) = start().await;

        let (dashboard, mut dashboard_rx) = open(addr, Endpoint::Dashboard).await;
        let (session, mut session_rx) =
            open(addr, Endpoint::Session("S-relay".to_string())).await;

        let tab = Event::new(
            EventType::Screen,
            "S-relay",
            1_700_000_000_000,
            json!({"trigger": "tab_change", "visible": false}),
        );
        assert!(session.send(&tab).await);

        let relayed = tokio::time::timeout(Duration::from_secs(5), dashboard_rx.messages.recv())
            .await
            .expect("No relayed event")
            .expect("Dashboard channel closed");
        let event = Event::from_wire(relayed).expect("Not a live event");
        assert_eq!(event.event_type(), &EventType::Screen);
        assert_eq!(event.session_id(), "S-relay");
        // The relay never restamps
        assert_eq!(event.timestamp(), 1_700_000_000_000);
        assert_eq!(event.field("trigger").unwrap(), "tab_change");

        let score = tokio::time::timeout(Duration::from_secs(5), dashboard_rx.messages.recv())
            .await
            .expect("No score update")
            .expect("Dashboard channel closed");
        assert_eq!(score.kind, SCORE_UPDATE_TYPE);
        assert_eq!(score.data["status"], "NORMAL");

        // Crossing the flagged threshold alerts the session
        let paste = Event::new(
            EventType::Screen,
            "S-relay",
            1_700_000_000_500,
            json!({"trigger": "paste"}),
        );
        assert!(session.send(&paste).await);

        let notice = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match session_rx.notices.recv().await {
                    Some(TransportNotice::Alert { message }) => return message,
                    Some(_) => continue,
                    None => panic!("Notice channel closed"),
                }
            }
        })
        .await
        .expect("No alert");
        assert_eq!(notice, "Suspicious behavior detected!");

        session.disconnect().await;
        dashboard.disconnect().await;
        let _ = shutdown_tx.send(());
    }
}

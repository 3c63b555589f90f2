//! End-to-end bridge scenarios over a real broadcast bus.

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use ractor::{Actor, ActorProcessingErr, ActorRef};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::actors::bridge::{
        BridgeError, BridgeEvent, BridgeHandle, BridgePhase, ChannelListener,
    };
    use crate::actors::bus::{publish_message, BroadcastBusActor, BusDelivery, BusMsg};
    use crate::config::BridgeConfig;
    use shared_types::{
        JobDescriptor, MessageKind, ProtocolMessage, TaskType, AGENT_SOURCE, CONTROLLER_SOURCE,
    };

    /// A scripted worker-agent sitting on the bus: answers probes, and runs
    /// a fixed two-page job when it sees START_TASK.
    #[derive(Debug, Default)]
    struct FakeAgent;

    #[async_trait]
    impl Actor for FakeAgent {
        type Msg = BusDelivery;
        type State = ActorRef<BusMsg>;
        type Arguments = ActorRef<BusMsg>;

        async fn pre_start(
            &self,
            myself: ActorRef<Self::Msg>,
            bus: Self::Arguments,
        ) -> Result<Self::State, ActorProcessingErr> {
            bus.cast(BusMsg::Subscribe { subscriber: myself })
                .map_err(|e| ActorProcessingErr::from(e.to_string()))?;
            Ok(bus)
        }

        async fn handle(
            &self,
            _myself: ActorRef<Self::Msg>,
            message: Self::Msg,
            bus: &mut Self::State,
        ) -> Result<(), ActorProcessingErr> {
            let Some(decoded) = ProtocolMessage::from_value(&message.0) else {
                return Ok(());
            };
            if decoded.source != CONTROLLER_SOURCE {
                return Ok(());
            }
            match decoded.kind {
                MessageKind::Probe => {
                    let _ = publish_message(bus, &ProtocolMessage::probe_reply(AGENT_SOURCE));
                }
                MessageKind::StartTask => {
                    let _ = publish_message(bus, &ProtocolMessage::progress(AGENT_SOURCE, 1, 4));
                    let _ = publish_message(bus, &ProtocolMessage::progress(AGENT_SOURCE, 2, 9));
                    let _ = publish_message(bus, &ProtocolMessage::complete(AGENT_SOURCE, 2, 9));
                }
                _ => {}
            }
            Ok(())
        }
    }

    struct Fixture {
        bus: ActorRef<BusMsg>,
        bridge: BridgeHandle,
        events: mpsc::UnboundedReceiver<BridgeEvent>,
    }

    async fn fixture(config: BridgeConfig, with_agent: bool) -> Fixture {
        let (bus, _) = Actor::spawn(None, BroadcastBusActor, ()).await.unwrap();
        if with_agent {
            let (_agent, _) = Actor::spawn(None, FakeAgent, bus.clone()).await.unwrap();
        }
        let (tx, events) = mpsc::unbounded_channel();
        let (listener, _) = Actor::spawn(None, ChannelListener, tx).await.unwrap();
        let bridge = BridgeHandle::spawn(bus.clone(), listener, config)
            .await
            .unwrap();
        Fixture {
            bus,
            bridge,
            events,
        }
    }

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            probe_timeout_ms: 60,
            sim_reply_delay_ms: 10,
            sim_tick_interval_ms: 15,
            default_page_target: 3,
        }
    }

    /// Config where the probe window stays open long enough for a reply.
    fn patient_config() -> BridgeConfig {
        BridgeConfig {
            probe_timeout_ms: 2000,
            ..fast_config()
        }
    }

    fn job_with_target(pages: u32) -> JobDescriptor {
        JobDescriptor::new("market.example", "vintage camera", TaskType::OpenOnNew)
            .with_parameter("page_target", json!(pages))
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<BridgeEvent>) -> BridgeEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within deadline")
            .expect("listener channel open")
    }

    #[tokio::test]
    async fn test_probe_timeout_reports_undetected_exactly_once() {
        let mut fx = fixture(fast_config(), false).await;

        assert_eq!(next_event(&mut fx.events).await, BridgeEvent::StatusChange(false));

        // No stacked or leftover timers: the window stays quiet.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fx.events.try_recv().is_err());

        let state = fx.bridge.state().await.unwrap();
        assert!(!state.agent_detected);
        assert!(!state.probing);
        assert_eq!(state.phase, BridgePhase::Undetected);
    }

    #[tokio::test]
    async fn test_manual_reprobe_supersedes_previous_timeout() {
        let mut fx = fixture(
            BridgeConfig {
                probe_timeout_ms: 120,
                ..fast_config()
            },
            false,
        )
        .await;

        // Re-probe midway through the first window; only one timeout may fire.
        tokio::time::sleep(Duration::from_millis(60)).await;
        fx.bridge.probe().unwrap();

        assert_eq!(next_event(&mut fx.events).await, BridgeEvent::StatusChange(false));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(fx.events.try_recv().is_err(), "superseded timer must not fire");
    }

    #[tokio::test]
    async fn test_agent_detection_and_duplicate_reply_idempotence() {
        let mut fx = fixture(patient_config(), false).await;

        publish_message(&fx.bus, &ProtocolMessage::probe_reply(AGENT_SOURCE)).unwrap();
        publish_message(&fx.bus, &ProtocolMessage::probe_reply(AGENT_SOURCE)).unwrap();

        assert_eq!(next_event(&mut fx.events).await, BridgeEvent::StatusChange(true));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            fx.events.try_recv().is_err(),
            "duplicate reply must not re-notify"
        );

        let state = fx.bridge.state().await.unwrap();
        assert!(state.agent_detected);
        assert!(state.last_probe_reply_at.is_some());
        assert_eq!(state.phase, BridgePhase::Detected);
    }

    #[tokio::test]
    async fn test_full_round_trip_with_scripted_agent() {
        let mut fx = fixture(patient_config(), true).await;

        assert_eq!(next_event(&mut fx.events).await, BridgeEvent::StatusChange(true));

        fx.bridge.dispatch(job_with_target(2)).await.unwrap();

        assert_eq!(
            next_event(&mut fx.events).await,
            BridgeEvent::Progress { pages: 1, ads: 4 }
        );
        assert_eq!(
            next_event(&mut fx.events).await,
            BridgeEvent::Progress { pages: 2, ads: 9 }
        );
        assert_eq!(
            next_event(&mut fx.events).await,
            BridgeEvent::Complete { pages: 2, ads: 9 }
        );

        // Completion resets the bridge for the next job.
        let state = fx.bridge.state().await.unwrap();
        assert!(!state.dispatched);
        assert!(!state.running);
        assert_eq!(state.phase, BridgePhase::Detected);
    }

    #[tokio::test]
    async fn test_dispatch_requires_agent_or_simulation() {
        let mut fx = fixture(fast_config(), false).await;

        assert_eq!(next_event(&mut fx.events).await, BridgeEvent::StatusChange(false));
        let err = fx.bridge.dispatch(job_with_target(2)).await.unwrap_err();
        assert_eq!(err, BridgeError::AgentUnavailable);
    }

    #[tokio::test]
    async fn test_double_dispatch_is_rejected() {
        let mut fx = fixture(patient_config(), false).await;

        fx.bridge.start_simulation(job_with_target(1000)).unwrap();
        assert_eq!(next_event(&mut fx.events).await, BridgeEvent::StatusChange(true));

        fx.bridge.dispatch(job_with_target(1000)).await.unwrap();
        let err = fx.bridge.dispatch(job_with_target(1000)).await.unwrap_err();
        assert_eq!(err, BridgeError::AlreadyDispatched);
    }

    #[tokio::test]
    async fn test_simulation_runs_job_to_completion() {
        let mut fx = fixture(patient_config(), false).await;

        fx.bridge.start_simulation(job_with_target(3)).unwrap();

        assert_eq!(next_event(&mut fx.events).await, BridgeEvent::StatusChange(true));
        for expected_page in 1..=3u32 {
            match next_event(&mut fx.events).await {
                BridgeEvent::Progress { pages, .. } => assert_eq!(pages, expected_page),
                other => panic!("expected progress, got {other:?}"),
            }
        }
        match next_event(&mut fx.events).await {
            BridgeEvent::Complete { pages, .. } => assert_eq!(pages, 3),
            other => panic!("expected completion, got {other:?}"),
        }

        // Exactly three PROGRESS and one COMPLETE: nothing else follows.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.events.try_recv().is_err());

        let state = fx.bridge.state().await.unwrap();
        assert!(!state.running);
        assert!(!state.dispatched);
        assert!(!state.simulating);
    }

    #[tokio::test]
    async fn test_stop_simulation_is_silent_and_leaves_bridge_ready() {
        let mut fx = fixture(patient_config(), false).await;

        fx.bridge.start_simulation(job_with_target(1000)).unwrap();
        assert_eq!(next_event(&mut fx.events).await, BridgeEvent::StatusChange(true));
        // Let at least one page land before cancelling.
        match next_event(&mut fx.events).await {
            BridgeEvent::Progress { .. } => {}
            other => panic!("expected progress, got {other:?}"),
        }

        fx.bridge.stop_simulation().unwrap();
        // The state RPC serializes behind the stop.
        let state = fx.bridge.state().await.unwrap();
        assert!(!state.simulating);
        assert!(!state.running);
        assert!(!state.dispatched);
        assert!(state.agent_detected);

        // Stragglers published before the stop may still drain, but the
        // cancellation itself is silent: no COMPLETE, no ERROR, and nothing
        // at all once the pipeline is empty.
        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Ok(event) = fx.events.try_recv() {
            assert!(
                matches!(event, BridgeEvent::Progress { .. }),
                "cancellation must be silent, got {event:?}"
            );
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fx.events.try_recv().is_err());

        // Ready for a fresh dispatch right away.
        fx.bridge.dispatch(job_with_target(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_and_malformed_traffic_is_ignored() {
        let mut fx = fixture(patient_config(), false).await;

        // Raw garbage, a foreign source, and a peer echoing controller kinds.
        fx.bus
            .cast(BusMsg::Publish {
                message: json!({"totally": "unrelated"}),
            })
            .unwrap();
        let foreign = ProtocolMessage::progress("rando-service", 9, 9);
        publish_message(&fx.bus, &foreign).unwrap();
        publish_message(&fx.bus, &ProtocolMessage::probe(AGENT_SOURCE)).unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(fx.events.try_recv().is_err(), "noise must never surface");

        // Bridge still healthy afterwards.
        let state = fx.bridge.state().await.unwrap();
        assert!(!state.agent_detected);
    }

    #[tokio::test]
    async fn test_error_report_resets_for_redispatch() {
        let mut fx = fixture(patient_config(), false).await;

        publish_message(&fx.bus, &ProtocolMessage::probe_reply(AGENT_SOURCE)).unwrap();
        assert_eq!(next_event(&mut fx.events).await, BridgeEvent::StatusChange(true));

        fx.bridge.dispatch(job_with_target(5)).await.unwrap();
        publish_message(
            &fx.bus,
            &ProtocolMessage::error_report(AGENT_SOURCE, "target site rate-limited us"),
        )
        .unwrap();

        assert_eq!(
            next_event(&mut fx.events).await,
            BridgeEvent::Error("target site rate-limited us".to_string())
        );

        let state = fx.bridge.state().await.unwrap();
        assert!(!state.dispatched);
        assert!(!state.running);

        // The failure unblocks the next attempt.
        fx.bridge.dispatch(job_with_target(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_listening_entirely() {
        let mut fx = fixture(patient_config(), false).await;

        publish_message(&fx.bus, &ProtocolMessage::probe_reply(AGENT_SOURCE)).unwrap();
        assert_eq!(next_event(&mut fx.events).await, BridgeEvent::StatusChange(true));

        fx.bridge.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The tap has left the bus; later traffic is never processed.
        let count = ractor::call!(fx.bus, |reply| BusMsg::SubscriberCount { reply }).unwrap();
        assert_eq!(count, 0);

        publish_message(&fx.bus, &ProtocolMessage::progress(AGENT_SOURCE, 1, 1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fx.events.try_recv().is_err());

        assert_eq!(
            fx.bridge.state().await.unwrap_err(),
            BridgeError::Terminated
        );
    }
}

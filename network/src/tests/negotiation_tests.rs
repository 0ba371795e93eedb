use crate::loopback::LoopbackNetwork;
use crate::media::{LocalMedia, LocalTrack};
use crate::peer_link::{LinkEvent, PeerLink, RemoteTrack, RetryPolicy};
use crate::protocol::{IceCandidate, SessionDescription, SignalPayload};
use crate::transport::{
    MediaTransport, SignalingState, TransportEvent, TransportProvider, TransportState,
};
use async_trait::async_trait;
use mockall::mock;
use session_core::{Error, LinkState, MediaKind, SessionIdentity};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// One end of a pair, with everything its link emitted
struct Side {
    link: PeerLink,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    transport_events: mpsc::UnboundedReceiver<(SessionIdentity, TransportEvent)>,
    outbox: Vec<SignalPayload>,
    states: Vec<LinkState>,
    streams: Vec<Vec<RemoteTrack>>,
    failures: Vec<String>,
}

impl Side {
    async fn open(
        network: &LoopbackNetwork,
        local: &str,
        remote: &str,
        tracks: &[Arc<LocalTrack>],
    ) -> Self {
        let (transport_tx, transport_events) = mpsc::unbounded_channel();
        let (link_tx, link_events) = mpsc::unbounded_channel();
        let transport = network
            .provider(local)
            .create(&remote.into(), transport_tx)
            .await
            .unwrap();
        let link = PeerLink::open(local.into(), remote.into(), transport, tracks, link_tx)
            .await
            .unwrap();

        Self {
            link,
            link_events,
            transport_events,
            outbox: Vec::new(),
            states: Vec::new(),
            streams: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Feed transport events to the link and collect what it emitted
    async fn step(&mut self) -> bool {
        let mut progressed = false;
        while let Ok((_, event)) = self.transport_events.try_recv() {
            self.link.on_transport_event(event).await.unwrap();
            progressed = true;
        }
        while let Ok(event) = self.link_events.try_recv() {
            progressed = true;
            match event {
                LinkEvent::Signal { payload, .. } => self.outbox.push(payload),
                LinkEvent::StateChanged { state, .. } => self.states.push(state),
                LinkEvent::RemoteStream { tracks, .. } => self.streams.push(tracks),
                LinkEvent::Failed { reason, .. } => self.failures.push(reason),
            }
        }
        progressed
    }

    fn offers(&self) -> usize {
        self.outbox
            .iter()
            .filter(|p| matches!(p, SignalPayload::Offer { .. }))
            .count()
    }
}

async fn deliver(from: &mut Side, to: &mut Side) -> bool {
    let outbox = std::mem::take(&mut from.outbox);
    let delivered = !outbox.is_empty();
    for payload in outbox {
        to.link.handle_signal(payload).await.unwrap();
    }
    delivered
}

/// Exchange everything until both sides go quiet
async fn pump(a: &mut Side, b: &mut Side) {
    for _ in 0..100 {
        let mut progressed = a.step().await;
        progressed |= b.step().await;
        progressed |= deliver(a, b).await;
        progressed |= deliver(b, a).await;
        if !progressed {
            return;
        }
    }
    panic!("Negotiation did not settle");
}

async fn connected_pair(network: &LoopbackNetwork, polite: &str, impolite: &str) -> (Side, Side) {
    let media_p = LocalMedia::camera_and_microphone();
    let media_i = LocalMedia::camera_and_microphone();
    let mut p = Side::open(network, polite, impolite, media_p.tracks()).await;
    let mut i = Side::open(network, impolite, polite, media_i.tracks()).await;
    assert!(p.link.is_polite());
    assert!(!i.link.is_polite());

    p.link.start().await.unwrap();
    i.link.start().await.unwrap();
    pump(&mut p, &mut i).await;
    (p, i)
}

#[test_log::test(tokio::test)]
async fn impolite_side_drives_the_initial_exchange() {
    let network = LoopbackNetwork::new();
    let (p, i) = connected_pair(&network, "ada", "bo").await;

    assert_eq!(p.link.state(), LinkState::Connected);
    assert_eq!(i.link.state(), LinkState::Connected);
    assert!(network.is_connected("ada", "bo"));
    assert_eq!(p.states, vec![LinkState::Negotiating, LinkState::Connected]);
    assert_eq!(i.states, vec![LinkState::Negotiating, LinkState::Connected]);

    let from_bo = p.link.remote_stream().unwrap();
    assert_eq!(from_bo.len(), 2);
    assert_eq!(
        network.transport("bo", "ada").unwrap().track_ids(),
        from_bo.iter().map(|t| t.track_id.clone()).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn polite_side_waits_for_an_offer() {
    let network = LoopbackNetwork::new();
    let mut p = Side::open(&network, "ada", "bo", &[]).await;
    p.link.start().await.unwrap();
    p.step().await;

    assert!(p.outbox.is_empty());
    assert_eq!(p.link.state(), LinkState::New);
    assert!(p.link.remote_stream().is_none());
}

#[test_log::test(tokio::test)]
async fn simultaneous_offers_settle_on_one_connection() {
    let network = LoopbackNetwork::new();
    let (mut p, mut i) = connected_pair(&network, "ada", "bo").await;

    // both sides start sharing at the same moment
    let screen_p = Arc::new(LocalTrack::new(MediaKind::Video, "screen-ada"));
    let screen_i = Arc::new(LocalTrack::new(MediaKind::Video, "screen-bo"));
    p.link.add_track(screen_p.clone()).await.unwrap();
    i.link.add_track(screen_i.clone()).await.unwrap();
    p.link.request_negotiation().await.unwrap();
    i.link.request_negotiation().await.unwrap();

    p.step().await;
    i.step().await;
    assert_eq!(p.offers(), 1);
    assert_eq!(i.offers(), 1);

    pump(&mut p, &mut i).await;

    assert_eq!(p.link.state(), LinkState::Connected);
    assert_eq!(i.link.state(), LinkState::Connected);
    for (a, b) in [("ada", "bo"), ("bo", "ada")] {
        let transport = network.transport(a, b).unwrap();
        assert_eq!(transport.signaling_state(), SignalingState::Stable);
    }

    // the polite side's rolled-back offer was renegotiated afterwards
    let at_p: Vec<_> = p.link.remote_stream().unwrap().iter().map(|t| t.track_id.clone()).collect();
    let at_i: Vec<_> = i.link.remote_stream().unwrap().iter().map(|t| t.track_id.clone()).collect();
    assert!(at_p.contains(&screen_i.id().to_string()));
    assert!(at_i.contains(&screen_p.id().to_string()));
}

#[tokio::test]
async fn early_candidates_are_applied_in_arrival_order() {
    let network = LoopbackNetwork::new();
    let mut p = Side::open(&network, "s1", "t", &[]).await;
    let mut i = Side::open(&network, "t", "s1", &[]).await;

    for candidate in ["c1", "c2"] {
        p.link
            .handle_signal(SignalPayload::IceCandidate {
                candidate: IceCandidate {
                    candidate: candidate.to_string(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                },
            })
            .await
            .unwrap();
    }
    assert_eq!(p.link.pending_candidate_count(), 2);
    assert!(network.transport("s1", "t").unwrap().applied_candidates().is_empty());

    i.link.start().await.unwrap();
    i.step().await;
    deliver(&mut i, &mut p).await;

    assert_eq!(p.link.pending_candidate_count(), 0);
    let applied = network.transport("s1", "t").unwrap().applied_candidates();
    assert_eq!(applied.len(), 3);
    assert_eq!(&applied[..2], &["c1".to_string(), "c2".to_string()]);
}

#[tokio::test]
async fn answer_without_outstanding_offer_is_dropped() {
    let network = LoopbackNetwork::new();
    let mut p = Side::open(&network, "ada", "bo", &[]).await;

    p.link
        .handle_signal(SignalPayload::Answer {
            sdp: "late".to_string(),
        })
        .await
        .unwrap();
    p.step().await;

    assert_eq!(p.link.state(), LinkState::New);
    assert!(p.states.is_empty());
    assert!(!network.transport("ada", "bo").unwrap().is_closed());
}

#[tokio::test]
async fn closed_link_rejects_signals() {
    let network = LoopbackNetwork::new();
    let (mut p, mut i) = connected_pair(&network, "ada", "bo").await;

    i.link.close().await;
    i.link.close().await;
    i.step().await;
    assert_eq!(i.states.iter().filter(|s| **s == LinkState::Closed).count(), 1);
    assert!(network.transport("bo", "ada").unwrap().is_closed());
    assert!(i.link.local_track_ids().is_empty());

    let result = i
        .link
        .handle_signal(SignalPayload::Offer {
            sdp: "again".to_string(),
        })
        .await;
    assert!(matches!(result, Err(Error::StaleSignal(remote)) if remote.as_str() == "ada"));

    // the other end only sees connectivity drop
    p.step().await;
    assert_eq!(p.link.state(), LinkState::Connected);
    assert!(!network.is_connected("ada", "bo"));
}

#[tokio::test]
async fn self_link_is_refused() {
    let network = LoopbackNetwork::new();
    let (tx, _rx) = mpsc::unbounded_channel();
    let (link_tx, _link_rx) = mpsc::unbounded_channel();
    let transport = network.provider("t").create(&"t".into(), tx).await.unwrap();

    let result = PeerLink::open("t".into(), "t".into(), transport, &[], link_tx).await;
    assert!(matches!(result, Err(Error::InvalidState(_))));
}

#[test_log::test(tokio::test)]
async fn stalled_negotiation_is_retried_then_abandoned() {
    let network = LoopbackNetwork::new();
    let mut i = Side::open(&network, "t", "s1", &[]).await;
    let policy = RetryPolicy {
        timeout: Duration::from_secs(15),
        max_retries: 2,
    };

    i.link.start().await.unwrap();
    i.step().await;
    assert_eq!(i.offers(), 1);

    let mut now = Instant::now();
    i.link.check_timeout(now, policy).await.unwrap();
    i.step().await;
    assert_eq!(i.offers(), 1);

    for attempt in 1..=2 {
        now += Duration::from_secs(16);
        i.link.check_timeout(now, policy).await.unwrap();
        i.step().await;
        assert_eq!(i.offers(), 1 + attempt);
        assert_eq!(i.link.state(), LinkState::Negotiating);
    }

    now += Duration::from_secs(16);
    i.link.check_timeout(now, policy).await.unwrap();
    i.step().await;

    assert_eq!(i.offers(), 3);
    assert_eq!(i.link.state(), LinkState::Closed);
    assert_eq!(i.failures.len(), 1);
    assert!(network.transport("t", "s1").unwrap().is_closed());
}

#[tokio::test]
async fn polite_side_does_not_reoffer_on_timeout() {
    let network = LoopbackNetwork::new();
    let mut p = Side::open(&network, "s1", "t", &[]).await;
    let mut i = Side::open(&network, "t", "s1", &[]).await;

    i.link.start().await.unwrap();
    i.step().await;
    deliver(&mut i, &mut p).await;
    p.step().await;
    assert_eq!(p.link.state(), LinkState::Negotiating);
    p.outbox.clear();

    p.link
        .check_timeout(Instant::now() + Duration::from_secs(20), RetryPolicy::default())
        .await
        .unwrap();
    p.step().await;
    assert_eq!(p.offers(), 0);
    assert_eq!(p.link.state(), LinkState::Negotiating);
}

#[test_log::test(tokio::test)]
async fn unanswered_new_link_offers_after_timeout() {
    let network = LoopbackNetwork::new();
    let (p, mut i) = connected_pair(&network, "s1", "t").await;

    // s1 rebuilds its side while t keeps the old link
    let mut old = p;
    old.link.close().await;
    let media = LocalMedia::camera_and_microphone();
    let mut p = Side::open(&network, "s1", "t", media.tracks()).await;
    p.link.start().await.unwrap();
    pump(&mut p, &mut i).await;
    assert_eq!(p.link.state(), LinkState::New);
    assert_eq!(i.link.state(), LinkState::Connected);
    assert!(!network.is_connected("s1", "t"));

    let policy = RetryPolicy::default();
    p.link
        .check_timeout(Instant::now() + Duration::from_secs(1), policy)
        .await
        .unwrap();
    p.step().await;
    assert_eq!(p.offers(), 0);

    p.link
        .check_timeout(Instant::now() + Duration::from_secs(16), policy)
        .await
        .unwrap();
    p.step().await;
    assert_eq!(p.offers(), 1);
    assert_eq!(p.link.state(), LinkState::Negotiating);

    pump(&mut p, &mut i).await;
    assert_eq!(p.link.state(), LinkState::Connected);
    assert_eq!(i.link.state(), LinkState::Connected);
    assert!(network.is_connected("s1", "t"));
    let at_t: Vec<_> = i.link.remote_stream().unwrap().iter().map(|t| t.track_id.clone()).collect();
    for track in media.tracks() {
        assert!(at_t.contains(&track.id().to_string()));
    }
}

#[tokio::test]
async fn negotiation_needed_waits_for_first_exchange() {
    let network = LoopbackNetwork::new();
    let media_p = LocalMedia::camera_and_microphone();
    let media_i = LocalMedia::camera_and_microphone();
    let mut p = Side::open(&network, "ada", "bo", media_p.tracks()).await;
    let mut i = Side::open(&network, "bo", "ada", media_i.tracks()).await;

    // raised by attaching the initial tracks
    p.link.on_transport_event(TransportEvent::NegotiationNeeded).await.unwrap();
    i.link.start().await.unwrap();
    i.link.on_transport_event(TransportEvent::NegotiationNeeded).await.unwrap();
    pump(&mut p, &mut i).await;

    assert_eq!(p.states, vec![LinkState::Negotiating, LinkState::Connected]);
    assert_eq!(i.states, vec![LinkState::Negotiating, LinkState::Connected]);

    i.link.on_transport_event(TransportEvent::NegotiationNeeded).await.unwrap();
    i.step().await;
    assert_eq!(i.offers(), 1);
}

#[tokio::test]
async fn screen_share_renegotiates_an_established_link() {
    let network = LoopbackNetwork::new();
    let (mut p, mut i) = connected_pair(&network, "s1", "t").await;

    let screen = Arc::new(LocalTrack::new(MediaKind::Video, "screen-s1"));
    p.link.add_track(screen.clone()).await.unwrap();
    p.link.request_negotiation().await.unwrap();
    pump(&mut p, &mut i).await;

    assert_eq!(p.link.state(), LinkState::Connected);
    assert_eq!(i.link.state(), LinkState::Connected);
    let latest = i.streams.last().unwrap();
    assert_eq!(latest.len(), 3);
    assert!(latest.iter().any(|t| t.track_id == screen.id()));

    p.link.remove_track(screen.id()).await.unwrap();
    p.link.request_negotiation().await.unwrap();
    pump(&mut p, &mut i).await;

    assert!(!p.link.local_track_ids().contains(&screen.id().to_string()));
    assert!(!network
        .transport("s1", "t")
        .unwrap()
        .track_ids()
        .contains(&screen.id().to_string()));
    assert_eq!(p.link.state(), LinkState::Connected);
}

#[tokio::test]
async fn failed_transport_is_renegotiated_by_impolite_side() {
    let network = LoopbackNetwork::new();
    let (mut p, mut i) = connected_pair(&network, "s1", "t").await;

    network
        .transport("t", "s1")
        .unwrap()
        .set_connection_state(TransportState::Failed);
    pump(&mut p, &mut i).await;

    assert_eq!(i.link.state(), LinkState::Connected);
    assert_eq!(p.link.state(), LinkState::Connected);
    assert_eq!(
        &i.states[i.states.len() - 2..],
        &[LinkState::Negotiating, LinkState::Connected]
    );
    assert!(network.is_connected("s1", "t"));
}

mock! {
    Transport {}

    #[async_trait]
    impl MediaTransport for Transport {
        async fn create_offer(&self) -> Result<SessionDescription, Error>;
        async fn create_answer(&self) -> Result<SessionDescription, Error>;
        async fn set_local_description(&self, description: SessionDescription) -> Result<(), Error>;
        async fn set_remote_description(&self, description: SessionDescription) -> Result<(), Error>;
        async fn rollback(&self) -> Result<(), Error>;
        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), Error>;
        async fn has_remote_description(&self) -> bool;
        fn signaling_state(&self) -> SignalingState;
        async fn add_track(&self, track: Arc<LocalTrack>) -> Result<(), Error>;
        async fn remove_track(&self, track_id: &str) -> Result<(), Error>;
        async fn close(&self) -> Result<(), Error>;
    }
}

#[tokio::test]
async fn open_fails_when_tracks_cannot_be_attached() {
    let mut transport = MockTransport::new();
    transport
        .expect_add_track()
        .times(1)
        .returning(|_| Err(Error::Negotiation("no sender".to_string())));
    let (link_tx, _link_rx) = mpsc::unbounded_channel();

    let media = LocalMedia::camera_and_microphone();
    let result = PeerLink::open(
        "t".into(),
        "s1".into(),
        Arc::new(transport),
        media.tracks(),
        link_tx,
    )
    .await;
    assert!(matches!(result, Err(Error::Negotiation(_))));
}

#[tokio::test]
async fn offer_failure_leaves_link_negotiating_without_signal() {
    let mut transport = MockTransport::new();
    transport
        .expect_create_offer()
        .returning(|| Err(Error::Negotiation("ice gathering failed".to_string())));
    transport
        .expect_signaling_state()
        .return_const(SignalingState::Stable);
    let (link_tx, mut link_rx) = mpsc::unbounded_channel();

    let mut link = PeerLink::open("t".into(), "s1".into(), Arc::new(transport), &[], link_tx)
        .await
        .unwrap();
    assert!(link.start().await.is_err());
    assert_eq!(link.state(), LinkState::Negotiating);

    let mut signals = 0;
    while let Ok(event) = link_rx.try_recv() {
        if matches!(event, LinkEvent::Signal { .. }) {
            signals += 1;
        }
    }
    assert_eq!(signals, 0);
}

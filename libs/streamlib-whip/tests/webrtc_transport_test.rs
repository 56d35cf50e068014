// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

mod common;

use std::time::Duration;
use streamlib_whip::sdp::{SessionDescription, extract_ice_credentials};
use streamlib_whip::{MediaKind, PeerTransport, TransportEvent, WebRtcTransport, WhipConfig};

#[tokio::test]
async fn test_send_only_offer_has_audio_and_video() {
    common::init_tracing();
    let transport = WebRtcTransport::new_send_only(&WhipConfig::default())
        .await
        .unwrap();

    let offer = transport.create_offer().await.unwrap();
    let description = SessionDescription::parse(&offer).unwrap();
    let kinds: Vec<&str> = description
        .media
        .iter()
        .filter_map(|section| section.kind())
        .collect();
    assert_eq!(kinds, vec!["video", "audio"]);
    assert!(offer.contains("H264/90000"));
    assert!(offer.contains("opus/48000/2"));
    assert!(offer.contains("a=sendonly"));

    let credentials = extract_ice_credentials(&offer).unwrap();
    assert!(!credentials.username_fragment.is_empty());
    assert!(!credentials.password.is_empty());

    let transceivers = transport.transceivers().await;
    assert_eq!(transceivers.len(), 2);
    for transceiver in &transceivers {
        assert!(offer.contains(&format!("a=mid:{}\r\n", transceiver.mid)));
    }
    assert!(transceivers.iter().any(|t| t.kind == MediaKind::Video));
    assert!(transceivers.iter().any(|t| t.kind == MediaKind::Audio));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_gathered_candidates_resolve_to_a_transceiver() {
    common::init_tracing();
    let transport = WebRtcTransport::new_send_only(&WhipConfig::default())
        .await
        .unwrap();
    let mut events = transport.subscribe();

    let offer = transport.create_offer().await.unwrap();
    transport.set_local_description(&offer).await.unwrap();

    let mut mids = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Candidate(candidate) => mids.push(candidate.mid),
                TransportEvent::EndOfCandidates => break,
                _ => {}
            }
        }
    })
    .await
    .expect("ICE gathering finished");

    assert!(!mids.is_empty(), "no host candidates gathered");
    let transceivers = transport.transceivers().await;
    for mid in &mids {
        assert!(
            transceivers.iter().any(|t| &t.mid == mid),
            "candidate mid {:?} has no transceiver",
            mid
        );
    }

    transport.close().await.unwrap();
}

use broadcast_session_lib::peer::LinkState;
use broadcast_session_lib::signaling::{
    ActionKind, InboundEvent, OutboundEvent, ParticipantsUpdated, Signal,
};
use broadcast_session_lib::{MediaAccessError, Role, SessionConfig, SessionNotice};
use std::time::Duration;

use crate::support::*;

#[tokio::test]
async fn viewer_join_gets_one_offer_and_connects_after_answer() {
    let mut h = HarnessBuilder::new(Role::Broadcaster).start();
    h.go_live(&[]).await;

    h.push(joined("user-v1"));
    let status = h.status().await;
    assert_eq!(h.channel.offers_to("user-v1"), 1);
    assert_eq!(status.links.get(&id("user-v1")), Some(&LinkState::Negotiating));
    assert!(status.session.roster.contains(&id("user-v1")));
    // camera and mic tracks went in before the offer
    assert_eq!(h.factory.latest("user-v1").attached_tracks(), 2);

    h.push(viewer_answer("user-v1"));
    let status = h
        .wait_until("link connected", |s| {
            s.links.get(&id("user-v1")) == Some(&LinkState::Connected)
        })
        .await;
    assert_eq!(status.links.len(), 1);
    assert_eq!(h.channel.offers_to("user-v1"), 1);
    assert!(h
        .drain_notices()
        .contains(&SessionNotice::LinkConnected(id("user-v1"))));
}

#[tokio::test]
async fn duplicate_join_reuses_the_link() {
    let h = HarnessBuilder::new(Role::Broadcaster).start();
    h.go_live(&[]).await;

    h.push(joined("user-v1"));
    h.push(viewer_answer("user-v1"));
    h.wait_until("link connected", |s| {
        s.links.get(&id("user-v1")) == Some(&LinkState::Connected)
    })
    .await;

    h.push(joined("user-v1"));
    let status = h.status().await;
    assert_eq!(h.factory.links_for("user-v1").len(), 1);
    assert_eq!(h.channel.offers_to("user-v1"), 1);
    assert_eq!(status.session.roster, vec![id("user-v1")]);
    assert_eq!(status.links.get(&id("user-v1")), Some(&LinkState::Connected));
}

fn camera_denied() -> MediaAccessError {
    MediaAccessError::PermissionDenied("camera".into())
}

#[tokio::test]
async fn first_offer_waits_for_local_media() {
    let (media, gate) = ScriptedMedia::gated();
    let h = HarnessBuilder::new(Role::Broadcaster).media(media).start();

    h.push(session_info(true, &["user-v1"]));
    h.push(joined("user-v2"));
    let status = h.status().await;
    assert_eq!(status.links.len(), 2);
    assert_eq!(h.channel.offers_to("user-v1"), 0);
    assert_eq!(h.channel.offers_to("user-v2"), 0);

    gate.notify_one();
    h.wait_until("local media", |s| s.media.has_stream).await;
    for v in ["user-v1", "user-v2"] {
        assert_eq!(h.channel.offers_to(v), 1);
        assert_eq!(h.factory.latest(v).attached_tracks(), 2);
    }
}

#[tokio::test]
async fn failed_capture_still_offers_held_links() {
    let mut h = HarnessBuilder::new(Role::Broadcaster)
        .media(ScriptedMedia::failing(camera_denied()))
        .start();
    h.push(session_info(true, &["user-v1"]));
    h.wait_for_notice("media error", |n| matches!(n, SessionNotice::MediaError(_)))
        .await;

    let status = h.status().await;
    assert_eq!(h.channel.offers_to("user-v1"), 1);
    assert_eq!(h.factory.latest("user-v1").attached_tracks(), 0);
    assert_eq!(status.links.get(&id("user-v1")), Some(&LinkState::Negotiating));
}

#[tokio::test]
async fn late_media_renegotiates_connected_link_once() {
    let mut h = HarnessBuilder::new(Role::Broadcaster)
        .media(ScriptedMedia::failing_once(camera_denied()))
        .start();
    h.push(session_info(true, &[]));
    h.wait_for_notice("media error", |n| matches!(n, SessionNotice::MediaError(_)))
        .await;

    h.push(joined("user-v1"));
    h.push(viewer_answer("user-v1"));
    h.wait_until("link connected", |s| {
        s.links.get(&id("user-v1")) == Some(&LinkState::Connected)
    })
    .await;
    let link = h.factory.latest("user-v1");
    assert_eq!(link.attached_tracks(), 0);
    assert_eq!(h.channel.offers_to("user-v1"), 1);

    h.handle.toggle_camera().await.unwrap();
    h.wait_until("local media", |s| s.media.has_stream).await;
    let status = h.status().await;

    assert_eq!(link.attached_tracks(), 1);
    assert_eq!(h.channel.offers_to("user-v1"), 2);
    assert!(!link.is_closed());
    assert_eq!(h.factory.links_for("user-v1").len(), 1);
    assert_eq!(status.links.get(&id("user-v1")), Some(&LinkState::Connected));

    h.push(viewer_answer("user-v1"));
    h.status().await;
    assert_eq!(h.channel.offers_to("user-v1"), 2);
}

#[tokio::test]
async fn renegotiation_waits_for_outstanding_answer() {
    let mut h = HarnessBuilder::new(Role::Broadcaster)
        .factory(FakeFactory::silent())
        .media(ScriptedMedia::failing_once(camera_denied()))
        .start();
    h.push(session_info(true, &[]));
    h.wait_for_notice("media error", |n| matches!(n, SessionNotice::MediaError(_)))
        .await;

    h.push(joined("user-v1"));
    h.status().await;
    assert_eq!(h.channel.offers_to("user-v1"), 1);

    // media arrives while the first offer is still unanswered
    h.handle.toggle_camera().await.unwrap();
    h.wait_until("local media", |s| s.media.has_stream).await;
    assert_eq!(h.channel.offers_to("user-v1"), 1);
    assert_eq!(h.factory.latest("user-v1").offers(), 1);

    h.push(viewer_answer("user-v1"));
    h.status().await;
    assert_eq!(h.channel.offers_to("user-v1"), 2);
}

#[tokio::test]
async fn toggling_camera_in_place_sends_no_offer() {
    let h = HarnessBuilder::new(Role::Broadcaster).start();
    h.go_live(&[]).await;
    h.push(joined("user-v1"));
    h.push(viewer_answer("user-v1"));
    h.wait_until("link connected", |s| {
        s.links.get(&id("user-v1")) == Some(&LinkState::Connected)
    })
    .await;
    assert!(h.status().await.media.camera_enabled);

    h.handle.toggle_camera().await.unwrap();
    let status = h.status().await;
    assert!(!status.media.camera_enabled);
    assert!(status.media.mic_enabled);

    h.handle.toggle_camera().await.unwrap();
    let status = h.status().await;
    assert!(status.media.camera_enabled);

    assert_eq!(h.channel.offers_to("user-v1"), 1);
    assert_eq!(h.media.calls(), 1);
}

#[tokio::test]
async fn failed_link_drops_only_that_viewer() {
    let h = HarnessBuilder::new(Role::Broadcaster).start();
    h.go_live(&[]).await;
    for v in ["user-v1", "user-v2"] {
        h.push(joined(v));
        h.push(viewer_answer(v));
    }
    h.wait_until("both connected", |s| {
        s.links.values().filter(|st| **st == LinkState::Connected).count() == 2
    })
    .await;

    h.factory.latest("user-v1").report(LinkState::Failed);
    let status = h
        .wait_until("v1 removed", |s| !s.links.contains_key(&id("user-v1")))
        .await;

    assert_eq!(status.links.get(&id("user-v2")), Some(&LinkState::Connected));
    assert_eq!(status.session.roster, vec![id("user-v2")]);
    assert!(h.factory.latest("user-v1").is_closed());
    assert!(!h.factory.latest("user-v2").is_closed());
}

#[tokio::test]
async fn events_from_a_replaced_link_are_ignored() {
    let h = HarnessBuilder::new(Role::Broadcaster).start();
    h.go_live(&[]).await;
    h.push(joined("user-v1"));
    h.push(viewer_answer("user-v1"));
    h.wait_until("connected", |s| !s.links.is_empty()).await;

    let old = h.factory.latest("user-v1");
    old.report(LinkState::Failed);
    h.wait_until("v1 removed", |s| s.links.is_empty()).await;

    h.push(joined("user-v1"));
    h.status().await;
    let fresh = h.factory.latest("user-v1");
    assert!(fresh.generation() > old.generation());

    old.report(LinkState::Disconnected);
    old.gather(candidate(9));
    let status = h.status().await;
    assert_eq!(status.links.get(&id("user-v1")), Some(&LinkState::Negotiating));
    assert!(h
        .channel
        .signals_to("user-v1")
        .iter()
        .all(|s| !matches!(s, Signal::Candidate { .. })));
}

#[tokio::test]
async fn local_candidates_are_forwarded_to_their_viewer() {
    let h = HarnessBuilder::new(Role::Broadcaster).start();
    h.go_live(&[]).await;
    h.push(joined("user-v1"));
    h.status().await;

    h.factory.latest("user-v1").gather(candidate(3));
    h.status().await;
    let signals = h.channel.signals_to("user-v1");
    assert_eq!(
        signals.last(),
        Some(&Signal::Candidate {
            candidate: candidate(3)
        })
    );
}

#[tokio::test]
async fn viewer_leaving_closes_its_link() {
    let h = HarnessBuilder::new(Role::Broadcaster).start();
    h.go_live(&[]).await;
    h.push(joined("user-v1"));
    h.push(joined("user-v2"));
    h.push(left("user-v1"));
    let status = h.status().await;

    assert!(h.factory.latest("user-v1").is_closed());
    assert_eq!(status.session.roster, vec![id("user-v2")]);
    assert_eq!(status.links.keys().cloned().collect::<Vec<_>>(), vec![id("user-v2")]);
}

#[tokio::test]
async fn roster_update_prunes_links() {
    let h = HarnessBuilder::new(Role::Broadcaster).start();
    h.go_live(&[]).await;
    h.push(joined("user-v1"));
    h.push(joined("user-v2"));
    h.push(InboundEvent::ParticipantsUpdated(ParticipantsUpdated {
        count: 2,
        student_ids: vec![id("user-v2")],
    }));
    let status = h.status().await;

    assert_eq!(status.session.participant_count, 2);
    assert!(h.factory.latest("user-v1").is_closed());
    assert!(!status.links.contains_key(&id("user-v1")));
    assert!(status.links.contains_key(&id("user-v2")));
}

#[tokio::test]
async fn repeated_session_info_keeps_links_inside_the_roster() {
    let h = HarnessBuilder::new(Role::Broadcaster).start();
    h.go_live(&[]).await;
    h.push(joined("user-v1"));
    h.status().await;

    h.push(session_info(true, &["user-v2"]));
    let status = h.status().await;

    assert_eq!(status.session.roster, vec![id("user-v2")]);
    assert_eq!(status.links.keys().cloned().collect::<Vec<_>>(), vec![id("user-v2")]);
    assert!(h.factory.latest("user-v1").is_closed());
    assert_eq!(h.channel.offers_to("user-v2"), 1);

    h.push(session_info(true, &[]));
    let status = h.status().await;
    assert!(status.session.roster.is_empty());
    assert!(status.links.is_empty());
    assert!(h.factory.latest("user-v2").is_closed());
}

#[tokio::test]
async fn joining_a_live_session_links_the_existing_roster() {
    let h = HarnessBuilder::new(Role::Broadcaster).start();
    let status = h.go_live(&["user-v1", "user-v2"]).await;

    // one broadcaster plus two viewers
    assert_eq!(status.session.participant_count, 3);
    assert_eq!(status.links.len(), 2);
    assert_eq!(h.channel.offers_to("user-v1"), 1);
    assert_eq!(h.channel.offers_to("user-v2"), 1);
}

#[tokio::test]
async fn early_viewer_candidate_is_dropped_not_fatal() {
    let h = HarnessBuilder::new(Role::Broadcaster)
        .factory(FakeFactory::silent())
        .start();
    h.go_live(&[]).await;
    h.push(joined("user-v1"));
    h.push(viewer_candidate("user-v1", 1));
    let status = h.status().await;

    let link = h.factory.latest("user-v1");
    assert!(link.remote_candidates().is_empty());
    assert!(!link.is_closed());
    assert_eq!(status.links.get(&id("user-v1")), Some(&LinkState::Negotiating));

    h.push(viewer_answer("user-v1"));
    h.push(viewer_candidate("user-v1", 2));
    h.status().await;
    assert_eq!(link.remote_candidates(), vec![candidate(2)]);
}

#[tokio::test]
async fn recording_and_mute_all_go_out_as_actions() {
    let mut h = HarnessBuilder::new(Role::Broadcaster).start();
    h.go_live(&[]).await;

    h.handle.toggle_recording().await.unwrap();
    h.handle.mute_all().await.unwrap();
    let status = h.status().await;
    assert!(status.session.is_recording);

    let actions: Vec<_> = h
        .channel
        .sent()
        .into_iter()
        .filter_map(|e| match e {
            OutboundEvent::InstructorAction(a) => Some((a.action, a.is_recording)),
            _ => None,
        })
        .collect();
    assert_eq!(
        actions,
        vec![
            (ActionKind::ToggleRecording, Some(true)),
            (ActionKind::MuteAll, None)
        ]
    );
    assert!(h
        .drain_notices()
        .contains(&SessionNotice::RecordingChanged(true)));
}

#[tokio::test]
async fn media_failure_leaves_controls_off() {
    let mut h = HarnessBuilder::new(Role::Broadcaster)
        .media(ScriptedMedia::failing(camera_denied()))
        .start();
    h.push(session_info(true, &[]));
    h.wait_for_notice("media error", |n| matches!(n, SessionNotice::MediaError(_)))
        .await;

    let status = h.status().await;
    assert!(!status.media.has_stream);
    assert!(!status.media.camera_enabled);
    assert!(status.session.is_live);
}

#[tokio::test(start_paused = true)]
async fn stalled_negotiation_is_closed_by_watchdog() {
    let config = SessionConfig {
        negotiation_timeout_secs: 5,
        ..SessionConfig::default()
    };
    let mut h = HarnessBuilder::new(Role::Broadcaster)
        .config(config)
        .factory(FakeFactory::silent())
        .start();
    h.go_live(&[]).await;
    h.push(joined("user-v1"));
    h.push(joined("user-v2"));
    h.push(viewer_answer("user-v2"));
    h.status().await;
    h.factory.latest("user-v2").report(LinkState::Connected);
    h.status().await;

    tokio::time::sleep(Duration::from_secs(7)).await;
    let status = h.status().await;

    assert!(!status.links.contains_key(&id("user-v1")));
    assert!(h.factory.latest("user-v1").is_closed());
    assert_eq!(status.links.get(&id("user-v2")), Some(&LinkState::Connected));
    assert!(h
        .drain_notices()
        .contains(&SessionNotice::LinkLost(id("user-v1"))));
}

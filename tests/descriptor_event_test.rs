// tests/descriptor_event_test.rs
//
// Covers the "unknown instance event" and "replay rejection" scenarios:
// an event for an onion address nobody tracks must leave the model
// untouched, and a descriptor whose `published` does not advance the
// instance's timestamp must be rejected without side effects.

use chrono::TimeZone;
use onionbalance::core::control::codec::Reply;
use onionbalance::core::control::event;
use onionbalance::core::descriptor::{self, ServiceKey};
use onionbalance::core::instance::Instance;
use onionbalance::core::introduction_point::IntroductionPoint;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;

fn test_key() -> ServiceKey {
    ServiceKey::from_private_key(RsaPrivateKey::new(&mut OsRng, 2048).unwrap()).unwrap()
}

#[test]
fn event_for_unknown_instance_leaves_model_untouched() {
    let mut tracked = Instance::new("tracked");
    let before = format!("{tracked:?}");

    let reply = Reply { code: 650, lines: vec!["HS_DESC_CONTENT zzzzzzzzzzzzzzzz.onion".to_string(), "irrelevant".to_string()] };
    let parsed_event = event::parse(&reply).expect("parses as a content event");

    let mut refs: Vec<&mut Instance> = vec![&mut tracked];
    event::apply(parsed_event, &mut refs).expect("unknown-instance events are not an error");

    assert_eq!(format!("{tracked:?}"), before);
}

#[test]
fn replay_descriptor_is_rejected_and_intro_points_unchanged() {
    let key = test_key();
    let points = vec![IntroductionPoint::new("a", &b"body-a"[..])];
    let published = chrono::Utc.timestamp_opt(2_000_000_000, 0).single().unwrap();
    let newer = descriptor::generate(&key, &points, 0, 0, published).unwrap();

    let mut instance = Instance::new("inst");
    let parsed = descriptor::parse(&newer).unwrap();
    instance.update(parsed).expect("first update always applies");
    assert_eq!(instance.introduction_points.len(), 1);

    let stale_points = vec![IntroductionPoint::new("a", &b"body-a"[..]), IntroductionPoint::new("b", &b"body-b"[..])];
    let stale_published = chrono::Utc.timestamp_opt(1_999_999_999, 0).single().unwrap();
    let stale = descriptor::generate(&key, &stale_points, 0, 0, stale_published).unwrap();
    let stale_parsed = descriptor::parse(&stale).unwrap();

    let err = instance.update(stale_parsed).unwrap_err();
    assert!(matches!(err, onionbalance::OnionBalanceError::DescriptorStale));
    assert_eq!(instance.introduction_points.len(), 1, "stale descriptor must not mutate state");
    assert!(!instance.changed_since_published);
}

use super::*;

#[test]
fn test_new_preserves_part_order() {
    let msg = Message::new(vec!["first", "second", "third"]);

    assert_eq!(msg.len(), 3);
    let payloads: Vec<&[u8]> = msg.iter().map(|p| p.payload().as_ref()).collect();
    assert_eq!(payloads, vec![&b"first"[..], b"second", b"third"]);
}

#[test]
fn test_new_parts_start_without_metadata() {
    let msg = Message::new(vec![b"hello".to_vec()]);
    assert!(msg.part(0).metadata().is_empty());
}

#[test]
#[should_panic(expected = "at least one part")]
fn test_empty_message_panics() {
    let _ = Message::new(Vec::<Vec<u8>>::new());
}

#[test]
#[should_panic]
fn test_part_index_out_of_range_panics() {
    let msg = Message::new(vec!["only"]);
    let _ = msg.part(1);
}

#[test]
fn test_metadata_set_is_per_part() {
    let mut msg = Message::new(vec!["a", "b"]);
    msg.part_mut(0).metadata_mut().set("foo", "bar");
    msg.part_mut(1).metadata_mut().set("root_foo", "bar2");

    assert_eq!(msg.part(0).metadata().get("foo"), Some("bar"));
    assert_eq!(msg.part(0).metadata().get("root_foo"), None);
    assert_eq!(msg.part(1).metadata().get("root_foo"), Some("bar2"));
}

#[test]
fn test_metadata_set_replaces_and_remove_returns_value() {
    let mut meta = Metadata::new();
    meta.set("k", "v1").set("k", "v2");

    assert_eq!(meta.len(), 1);
    assert_eq!(meta.remove("k").as_deref(), Some("v2"));
    assert!(meta.is_empty());
    assert_eq!(meta.remove("k"), None);
}

#[test]
fn test_metadata_equality_ignores_insertion_order() {
    let mut a = Metadata::new();
    a.set("x", "1").set("y", "2");
    let mut b = Metadata::new();
    b.set("y", "2").set("x", "1");

    assert_eq!(a, b);
}

#[test]
fn test_message_from_single_part() {
    let mut meta = Metadata::new();
    meta.set("mqtt_topic", "sensors/a");
    let msg = Message::from(Part::with_metadata("payload", meta));

    assert_eq!(msg.len(), 1);
    assert_eq!(msg.part(0).payload().as_ref(), b"payload");
    assert_eq!(msg.part(0).metadata().get("mqtt_topic"), Some("sensors/a"));
}

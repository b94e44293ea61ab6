use crate::{
    error::PersistError,
    key::Key,
    session::LifecycleState,
    test_support::*,
    types::Timestamp,
    value::Value,
};

#[test]
fn lifecycle_walks_transient_to_clean_to_dirty() {
    let (engine, _) = engine_with(vec![gadget_descriptor()]).expect("fixtures");
    let mut session = engine.session();

    let gadget = session.create("Gadget").expect("create");
    assert_eq!(session.state(gadget), LifecycleState::Transient);
    assert!(session.key(gadget).is_none());

    session
        .set_value(gadget, "label", Value::Text("probe".into()))
        .expect("set");
    assert_eq!(session.state(gadget), LifecycleState::Transient);

    session.insert(gadget).expect("insert");
    assert_eq!(session.state(gadget), LifecycleState::PersistentClean);
    assert!(session.key(gadget).is_some());

    session
        .set_value(gadget, "label", Value::Text("renamed".into()))
        .expect("set");
    assert_eq!(session.state(gadget), LifecycleState::PersistentDirty);

    session.flush().expect("flush");
    assert_eq!(session.state(gadget), LifecycleState::PersistentClean);

    session.delete(gadget).expect("delete");
    assert_eq!(session.state(gadget), LifecycleState::Deleted);
}

#[test]
fn unregistered_kind_is_rejected_at_create() {
    let (engine, _) = engine_with(vec![]).expect("fixtures");
    let mut session = engine.session();

    assert!(matches!(
        session.create("Ghost"),
        Err(PersistError::IllegalState { .. })
    ));
}

#[test]
fn every_value_shape_round_trips_through_the_store() {
    let (engine, store) = engine_with(vec![gadget_descriptor()]).expect("fixtures");
    let mut session = engine.session();

    let gadget = session.create("Gadget").expect("create");
    session.set_value(gadget, "flag", Value::Bool(true)).unwrap();
    session.set_value(gadget, "tiny", Value::Int(-128)).unwrap();
    session.set_value(gadget, "small", Value::Int(31_000)).unwrap();
    session.set_value(gadget, "medium", Value::Int(-2_000_000)).unwrap();
    session.set_value(gadget, "large", Value::Int(1 << 60)).unwrap();
    session.set_value(gadget, "ratio", Value::from(0.25f64)).unwrap();
    session
        .set_value(gadget, "label", Value::Text("widget".into()))
        .unwrap();
    session
        .set_value(
            gadget,
            "seen_at",
            Value::Timestamp(Timestamp::from_micros(1_700_000_000_000_000)),
        )
        .unwrap();
    session
        .set_value(gadget, "status", Value::Text("ACTIVE".into()))
        .unwrap();
    session
        .set_value(gadget, "checksum", Value::Blob(vec![7u8; 16]))
        .unwrap();
    session
        .set_value(gadget, "payload", Value::Blob(vec![1, 2, 3, 4, 5]))
        .unwrap();
    session
        .set_value(gadget, "scores", Value::from_list(vec![3i64, 1, 3]))
        .unwrap();
    session
        .set_value(
            gadget,
            "tags",
            Value::List(vec![Value::Text("a".into()), Value::Text("b".into())]),
        )
        .unwrap();

    session.insert(gadget).expect("insert");
    let key = session.key(gadget).expect("assigned").clone();
    assert!(store.contains(&key));

    // A fresh session sees identical field values.
    let mut reader = engine.session();
    let loaded = reader.load(&key).expect("load");
    for field in [
        "flag", "tiny", "small", "medium", "large", "ratio", "label", "seen_at", "status",
        "checksum", "payload", "scores", "tags",
    ] {
        assert_eq!(
            reader.value(loaded, field).expect("read"),
            session.value(gadget, field).expect("read"),
            "field {field} did not round-trip"
        );
    }
    assert_eq!(reader.value(loaded, "id").unwrap(), &Value::Int(1));
    assert_eq!(reader.state(loaded), LifecycleState::PersistentClean);
}

#[test]
fn absent_scalar_reads_back_null_but_stays_explicit_in_writes() {
    let (engine, store) = engine_with(vec![gadget_descriptor()]).expect("fixtures");
    let mut session = engine.session();

    let gadget = session.create("Gadget").expect("create");
    session.insert(gadget).expect("insert");

    let entity = store
        .entity(session.key(gadget).expect("assigned"))
        .expect("stored");
    // Unset fields were still written, each with an explicit null.
    assert_eq!(entity.get("label"), Some(&Value::Null));
    assert_eq!(entity.get("payload"), Some(&Value::Null));
}

#[test]
fn short_blob_cap_is_enforced_at_assignment() {
    let (engine, _) = engine_with(vec![gadget_descriptor()]).expect("fixtures");
    let mut session = engine.session();

    let gadget = session.create("Gadget").expect("create");
    let err = session
        .set_value(gadget, "checksum", Value::Blob(vec![0u8; 17]))
        .unwrap_err();
    assert!(matches!(err, PersistError::Mapping { .. }));
}

#[test]
fn narrow_integer_overflow_is_a_mapping_error() {
    let (engine, _) = engine_with(vec![gadget_descriptor()]).expect("fixtures");
    let mut session = engine.session();

    let gadget = session.create("Gadget").expect("create");
    assert!(matches!(
        session.set_value(gadget, "tiny", Value::Int(200)),
        Err(PersistError::Mapping { .. })
    ));
}

#[test]
fn embedded_fields_flatten_with_prefix_and_null_emits_all_leaves() {
    let (engine, store) = engine_with(vec![person_descriptor()]).expect("fixtures");
    let mut session = engine.session();

    let person = session.create("Person").expect("create");
    session
        .set_value(person, "name", Value::Text("ada".into()))
        .unwrap();
    session
        .set_embedded_leaf(person, "address", "street", Value::Text("Wide Ln".into()))
        .unwrap();
    session
        .set_embedded_leaf(person, "address", "zip", Value::Int(1234))
        .unwrap();
    session.insert(person).expect("insert");

    let entity = store
        .entity(session.key(person).expect("assigned"))
        .expect("stored");
    assert_eq!(
        entity.get("address_street"),
        Some(&Value::Text("Wide Ln".into()))
    );
    assert_eq!(entity.get("address_city"), Some(&Value::Null));
    assert_eq!(entity.get("address_zip"), Some(&Value::Int(1234)));

    // A person with a null embedded record still writes every leaf.
    let hollow = session.create("Person").expect("create");
    session.insert(hollow).expect("insert");
    let entity = store
        .entity(session.key(hollow).expect("assigned"))
        .expect("stored");
    assert_eq!(entity.get("address_street"), Some(&Value::Null));
    assert_eq!(entity.get("address_city"), Some(&Value::Null));
    assert_eq!(entity.get("address_zip"), Some(&Value::Null));
}

#[test]
fn immutable_ancestor_rejected_after_persist() {
    // Concrete scenario: setting a non-null ancestor on an already-persisted
    // object must fail.
    let (engine, _) = engine_with(vec![attachment_descriptor(false)]).expect("fixtures");
    let mut session = engine.session();

    let attachment = session.create("Attachment").expect("create");
    session.insert(attachment).expect("insert");

    let other_root = Key::with_id(kind("Folder"), 99, None);
    let err = session
        .set_value(attachment, "owner", Value::Key(other_root))
        .unwrap_err();
    assert!(matches!(err, PersistError::ImmutableAncestor { .. }));
}

#[test]
fn ancestor_is_write_once_even_before_persist() {
    let (engine, _) = engine_with(vec![attachment_descriptor(false)]).expect("fixtures");
    let mut session = engine.session();

    let attachment = session.create("Attachment").expect("create");
    let first = Key::with_id(kind("Folder"), 1, None);
    let second = Key::with_id(kind("Folder"), 2, None);

    session
        .set_value(attachment, "owner", Value::Key(first.clone()))
        .expect("first assignment");
    // Re-assigning the same value is fine; a different one is not.
    session
        .set_value(attachment, "owner", Value::Key(first))
        .expect("idempotent assignment");
    assert!(matches!(
        session.set_value(attachment, "owner", Value::Key(second)),
        Err(PersistError::ImmutableAncestor { .. })
    ));
}

#[test]
fn missing_required_ancestor_fails_before_any_write() {
    let (engine, store) = engine_with(vec![attachment_descriptor(true)]).expect("fixtures");
    let mut session = engine.session();

    let attachment = session.create("Attachment").expect("create");
    let err = session.insert(attachment).unwrap_err();

    assert!(matches!(err, PersistError::MissingAncestor { .. }));
    assert_eq!(store.len(), 0);
    assert_eq!(session.state(attachment), LifecycleState::Transient);
    assert!(session.key(attachment).is_none());
}

#[test]
fn explicit_ancestor_field_drives_the_entity_group() {
    let (engine, store) = engine_with(vec![attachment_descriptor(false)]).expect("fixtures");
    let mut session = engine.session();

    let owner = Key::with_id(kind("Folder"), 7, None);
    let attachment = session.create("Attachment").expect("create");
    session
        .set_value(attachment, "owner", Value::Key(owner.clone()))
        .unwrap();
    session.insert(attachment).expect("insert");

    let key = session.key(attachment).expect("assigned");
    assert_eq!(key.parent(), Some(&owner));
    assert!(store.contains(key));

    // The encoded-key companion reflects the assigned identity.
    let encoded = session.value(attachment, "key").expect("read").clone();
    let decoded = crate::key::decode_key(encoded.as_text().expect("text")).expect("decodes");
    assert_eq!(&decoded, key);
}

#[test]
fn key_id_companion_never_changes_once_assigned() {
    let (engine, _) = engine_with(vec![gadget_descriptor()]).expect("fixtures");
    let mut session = engine.session();

    let gadget = session.create("Gadget").expect("create");
    session.insert(gadget).expect("insert");

    let err = session.set_value(gadget, "id", Value::Int(42)).unwrap_err();
    assert!(matches!(err, PersistError::IllegalState { .. }));
}

#[test]
fn detached_copy_is_frozen_at_copy_time() {
    let (engine, _) = engine_with(vec![gadget_descriptor()]).expect("fixtures");
    let mut session = engine.session();

    let gadget = session.create("Gadget").expect("create");
    session
        .set_value(gadget, "label", Value::Text("before".into()))
        .unwrap();
    session.insert(gadget).expect("insert");

    session
        .set_value(gadget, "label", Value::Text("after".into()))
        .unwrap();
    let copy = session.detach_copy(gadget);

    assert_eq!(copy.state(), LifecycleState::DetachedDirty);
    assert_eq!(copy.value("label"), Some(&Value::Text("after".into())));

    // Later session mutations do not reach the copy.
    session
        .set_value(gadget, "label", Value::Text("final".into()))
        .unwrap();
    assert_eq!(copy.value("label"), Some(&Value::Text("after".into())));
}

#[test]
fn version_property_stamps_and_increments() {
    let (engine, store) = engine_with(vec![versioned_note_descriptor()]).expect("fixtures");
    let mut session = engine.session();

    let note = session.create("Note").expect("create");
    session
        .set_value(note, "body", Value::Text("v1".into()))
        .unwrap();
    session.insert(note).expect("insert");

    let key = session.key(note).expect("assigned").clone();
    assert_eq!(store.entity(&key).unwrap().get("revision"), Some(&Value::Int(1)));

    session
        .set_value(note, "body", Value::Text("v2".into()))
        .unwrap();
    session.flush().expect("flush");
    assert_eq!(store.entity(&key).unwrap().get("revision"), Some(&Value::Int(2)));
}

#[test]
fn named_sequence_kinds_draw_ids_from_one_batched_range() {
    let store = CountingStore::new(MemoryStore::new());
    let counts = store.counts_handle();
    let mut engine = crate::session::Engine::new(store);
    engine.register(ticket_descriptor()).expect("register");

    let mut session = engine.session();
    let first = session.create("Ticket").expect("create");
    let second = session.create("Ticket").expect("create");
    session.insert(first).expect("insert");
    session.insert(second).expect("insert");

    // One range fetch covers both ids; auto-id kinds would have fetched
    // twice.
    assert_eq!(counts.get().allocates, 1);
    assert_eq!(session.key(first).unwrap().id().id(), Some(1));
    assert_eq!(session.key(second).unwrap().id().id(), Some(2));
}

#[test]
fn stale_version_surfaces_as_concurrent_modification() {
    let (engine, store) = engine_with(vec![versioned_note_descriptor()]).expect("fixtures");
    let mut session = engine.session();

    let note = session.create("Note").expect("create");
    session.insert(note).expect("insert");
    let key = session.key(note).expect("assigned").clone();

    // Another writer bumps the stored revision underneath this session.
    let mut meddler = engine.session();
    let other = meddler.load(&key).expect("load");
    meddler
        .set_value(other, "body", Value::Text("elsewhere".into()))
        .unwrap();
    meddler.flush().expect("flush");
    assert_eq!(store.entity(&key).unwrap().get("revision"), Some(&Value::Int(2)));

    session
        .set_value(note, "body", Value::Text("mine".into()))
        .unwrap();
    let err = session.flush().unwrap_err();
    assert!(err.is_concurrent_modification());
}

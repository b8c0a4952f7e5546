use peerlite_host::routing::validator::split_key;
use peerlite_host::routing::{
    ipns_record_key, public_key_record_key, IpnsEntry, IpnsValidator, KeyBook,
    NamespacedValidator, PublicKeyValidator, Validator,
};
use peerlite_host::{Keypair, RoutingError};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

fn in_an_hour() -> SystemTime {
    SystemTime::now() + Duration::from_secs(3600)
}

// ── Keys and namespaces ─────────────────────────────────────────

#[test]
fn split_key_separates_namespace() {
    let (namespace, rest) = split_key(b"/pk/abc/def").unwrap();
    assert_eq!(namespace, "pk");
    assert_eq!(rest, b"abc/def");
}

#[test]
fn split_key_rejects_malformed_keys() {
    for bad in [&b"pk/abc"[..], b"/pk", b"//abc", b""] {
        assert!(split_key(bad).is_err(), "{bad:?} should be rejected");
    }
}

#[test]
fn default_validators_cover_pk_and_ipns() {
    let validator = NamespacedValidator::with_defaults(KeyBook::new()).unwrap();
    assert_eq!(validator.namespaces(), vec!["ipns", "pk"]);
}

#[test]
fn registering_a_namespace_twice_fails() {
    let mut validator = NamespacedValidator::new();
    validator.register("pk", Arc::new(PublicKeyValidator)).unwrap();
    let err = validator
        .register("pk", Arc::new(PublicKeyValidator))
        .unwrap_err();
    assert!(matches!(err, RoutingError::ValidatorSetup(_)));
}

#[test]
fn invalid_namespace_names_are_rejected() {
    let mut validator = NamespacedValidator::new();
    assert!(validator.register("", Arc::new(PublicKeyValidator)).is_err());
    assert!(validator.register("a/b", Arc::new(PublicKeyValidator)).is_err());
}

#[test]
fn unknown_namespace_is_rejected() {
    let validator = NamespacedValidator::with_defaults(KeyBook::new()).unwrap();
    let err = validator.validate(b"/other/key", b"value").unwrap_err();
    assert!(matches!(err, RoutingError::InvalidRecord(_)));
}

#[test]
fn missing_namespace_is_rejected() {
    let validator = NamespacedValidator::with_defaults(KeyBook::new()).unwrap();
    assert!(validator.validate(b"no-namespace", b"value").is_err());
}

#[test]
fn select_with_no_values_is_not_found() {
    let validator = NamespacedValidator::with_defaults(KeyBook::new()).unwrap();
    let err = validator.select(b"/pk/x", &[]).unwrap_err();
    assert!(matches!(err, RoutingError::NotFound));
}

// ── Public key records ──────────────────────────────────────────

#[test]
fn public_key_record_for_own_peer_is_valid() {
    let key = Keypair::generate_ed25519();
    let record_key = public_key_record_key(&key.public().to_peer_id());
    let value = key.public().encode_protobuf();
    assert!(PublicKeyValidator.validate(&record_key, &value).is_ok());
}

#[test]
fn public_key_under_another_peer_is_rejected() {
    let key = Keypair::generate_ed25519();
    let other = Keypair::generate_ed25519();
    let record_key = public_key_record_key(&other.public().to_peer_id());
    let value = key.public().encode_protobuf();
    assert!(PublicKeyValidator.validate(&record_key, &value).is_err());
}

#[test]
fn garbage_public_key_is_rejected() {
    let key = Keypair::generate_ed25519();
    let record_key = public_key_record_key(&key.public().to_peer_id());
    assert!(PublicKeyValidator.validate(&record_key, b"garbage").is_err());
}

#[test]
fn public_key_select_skips_invalid_values() {
    let key = Keypair::generate_ed25519();
    let record_key = public_key_record_key(&key.public().to_peer_id());
    let values = vec![b"garbage".to_vec(), key.public().encode_protobuf()];
    assert_eq!(PublicKeyValidator.select(&record_key, &values).unwrap(), 1);
}

// ── Name records ────────────────────────────────────────────────

#[test]
fn name_record_verified_with_keybook_key() {
    let key = Keypair::generate_ed25519();
    let keybook = KeyBook::new();
    keybook.insert(key.public());
    let validator = IpnsValidator::new(keybook);

    let entry = IpnsEntry::create(&key, b"/ipfs/bafy".to_vec(), 1, in_an_hour(), false).unwrap();
    let record_key = ipns_record_key(&key.public().to_peer_id());
    assert!(validator
        .validate(&record_key, &entry.to_bytes().unwrap())
        .is_ok());
}

#[test]
fn name_record_falls_back_to_embedded_key() {
    let key = Keypair::generate_ed25519();
    let validator = IpnsValidator::new(KeyBook::new());

    let entry = IpnsEntry::create(&key, b"/ipfs/bafy".to_vec(), 1, in_an_hour(), true).unwrap();
    let record_key = ipns_record_key(&key.public().to_peer_id());
    assert!(validator
        .validate(&record_key, &entry.to_bytes().unwrap())
        .is_ok());
}

#[test]
fn name_record_without_any_key_is_rejected() {
    let key = Keypair::generate_ed25519();
    let validator = IpnsValidator::new(KeyBook::new());

    let entry = IpnsEntry::create(&key, b"v".to_vec(), 1, in_an_hour(), false).unwrap();
    let record_key = ipns_record_key(&key.public().to_peer_id());
    assert!(validator
        .validate(&record_key, &entry.to_bytes().unwrap())
        .is_err());
}

#[test]
fn name_record_signed_by_someone_else_is_rejected() {
    let owner = Keypair::generate_ed25519();
    let forger = Keypair::generate_ed25519();
    let validator = IpnsValidator::new(KeyBook::new());

    // Embedded key belongs to the forger, not the name owner.
    let entry = IpnsEntry::create(&forger, b"v".to_vec(), 1, in_an_hour(), true).unwrap();
    let record_key = ipns_record_key(&owner.public().to_peer_id());
    assert!(validator
        .validate(&record_key, &entry.to_bytes().unwrap())
        .is_err());
}

#[test]
fn tampered_name_record_is_rejected() {
    let key = Keypair::generate_ed25519();
    let validator = IpnsValidator::new(KeyBook::new());

    let mut entry = IpnsEntry::create(&key, b"original".to_vec(), 1, in_an_hour(), true).unwrap();
    entry.value = b"tampered".to_vec();
    let record_key = ipns_record_key(&key.public().to_peer_id());
    assert!(validator
        .validate(&record_key, &entry.to_bytes().unwrap())
        .is_err());
}

#[test]
fn expired_name_record_is_rejected() {
    let key = Keypair::generate_ed25519();
    let validator = IpnsValidator::new(KeyBook::new());

    let past = SystemTime::now() - Duration::from_secs(60);
    let entry = IpnsEntry::create(&key, b"v".to_vec(), 1, past, true).unwrap();
    assert!(entry.is_expired(SystemTime::now()));
    let record_key = ipns_record_key(&key.public().to_peer_id());
    assert!(validator
        .validate(&record_key, &entry.to_bytes().unwrap())
        .is_err());
}

#[test]
fn name_record_select_prefers_highest_sequence() {
    let key = Keypair::generate_ed25519();
    let validator = IpnsValidator::new(KeyBook::new());
    let record_key = ipns_record_key(&key.public().to_peer_id());

    let values: Vec<Vec<u8>> = [3, 7, 5]
        .into_iter()
        .map(|seq| {
            IpnsEntry::create(&key, format!("v{seq}"), seq, in_an_hour(), true)
                .unwrap()
                .to_bytes()
                .unwrap()
        })
        .collect();
    assert_eq!(validator.select(&record_key, &values).unwrap(), 1);
}

#[test]
fn name_record_select_breaks_ties_by_validity() {
    let key = Keypair::generate_ed25519();
    let validator = IpnsValidator::new(KeyBook::new());
    let record_key = ipns_record_key(&key.public().to_peer_id());

    let short = IpnsEntry::create(&key, b"a".to_vec(), 4, in_an_hour(), true).unwrap();
    let long = IpnsEntry::create(
        &key,
        b"b".to_vec(),
        4,
        SystemTime::now() + Duration::from_secs(7200),
        true,
    )
    .unwrap();
    let values = vec![short.to_bytes().unwrap(), long.to_bytes().unwrap()];
    assert_eq!(validator.select(&record_key, &values).unwrap(), 1);
}

#[test]
fn name_record_select_ignores_invalid_entries() {
    let key = Keypair::generate_ed25519();
    let validator = IpnsValidator::new(KeyBook::new());
    let record_key = ipns_record_key(&key.public().to_peer_id());

    let mut forged = IpnsEntry::create(&key, b"x".to_vec(), 99, in_an_hour(), true).unwrap();
    forged.sequence = 100;
    let genuine = IpnsEntry::create(&key, b"y".to_vec(), 2, in_an_hour(), true).unwrap();
    let values = vec![forged.to_bytes().unwrap(), genuine.to_bytes().unwrap()];
    assert_eq!(validator.select(&record_key, &values).unwrap(), 1);
}

#[test]
fn name_record_wire_format_round_trips() {
    let key = Keypair::generate_ed25519();
    let entry = IpnsEntry::create(&key, b"value".to_vec(), 12, in_an_hour(), true).unwrap();
    let back = IpnsEntry::from_bytes(&entry.to_bytes().unwrap()).unwrap();
    assert_eq!(back, entry);
    assert!(back.verify(&key.public()));
}

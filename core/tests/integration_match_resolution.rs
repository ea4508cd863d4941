//! Key import and match resolution, end to end
//!
//! A key exported by one device is imported by another, expanded into its
//! 144 identifiers, and every identifier the first device broadcasts during
//! that rolling period resolves back to it.
//!
//! Run with: cargo test --test integration_match_resolution

use en_toolkit_core::crypto::{derive_metadata_key, encrypt_metadata, TemporaryKey};
use en_toolkit_core::matching::{KeyImport, KnownKeyStore, KnownKeyTable, MatchResolver};
use en_toolkit_core::rotation::{epoch_start, Interval, ROLLING_PERIOD};
use en_toolkit_core::transport::ble::{Advertisement, AdvertisementPayload};
use rand::rngs::OsRng;
use std::time::UNIX_EPOCH;

const EPOCH: Interval = Interval::new(2642976);

fn heard(key: &TemporaryKey, interval: Interval) -> Advertisement {
    Advertisement::new(
        AdvertisementPayload::for_interval(key, interval, -42),
        -58,
        UNIX_EPOCH,
    )
}

#[test]
fn test_imported_key_resolves_whole_rolling_period() {
    let alice = TemporaryKey::generate(&mut OsRng, EPOCH.offset(40));
    assert_eq!(alice.rolling_start(), EPOCH);

    // Bob imports Alice's exported key
    let entry = KeyImport::from_exported(&alice.export())
        .unwrap()
        .with_label("Alice")
        .into_entry(EPOCH)
        .unwrap();
    assert_eq!(entry.identifiers().len(), ROLLING_PERIOD as usize);

    let table = KnownKeyTable::from_entries(vec![entry]);
    for n in 0..ROLLING_PERIOD {
        let resolved = MatchResolver::resolve(&table, heard(&alice, EPOCH.offset(n)));
        let matched = resolved.matched.expect("identifier in period should resolve");
        assert_eq!(matched.label, "Alice");
        assert_eq!(matched.interval, EPOCH.offset(n));
        assert_eq!(matched.rolling_start, EPOCH);
        assert_eq!(matched.metadata.tx_power, -42);
    }

    // First interval of the next epoch belongs to a different key
    let next = MatchResolver::resolve(&table, heard(&alice, EPOCH.offset(ROLLING_PERIOD)));
    assert!(next.matched.is_none());
    assert_eq!(epoch_start(EPOCH.offset(ROLLING_PERIOD)), EPOCH.offset(144));
}

#[test]
fn test_hex_and_base64_imports_resolve_reference_vector() {
    let hex_entry = KeyImport::from_hex("75c734c6dd1a782de7a965da5eb93125")
        .unwrap()
        .into_entry(EPOCH)
        .unwrap();
    let b64_entry = KeyImport::from_base64("dcc0xt0aeC3nqWXaXrkxJQ==")
        .unwrap()
        .with_label("Carol")
        .into_entry(EPOCH)
        .unwrap();

    let table = KnownKeyTable::from_entries(vec![hex_entry]);
    let advertisement = heard(b64_entry.key(), EPOCH);
    assert_eq!(
        advertisement.identifier.to_hex(),
        "8be6cd371c5c891604bfbe49df845096"
    );

    let resolved = MatchResolver::resolve(&table, advertisement);
    assert_eq!(resolved.label(), Some("EN device"));
}

#[test]
fn test_metadata_decrypts_reference_vector() {
    let key = KeyImport::from_hex("75c734c6dd1a782de7a965da5eb93125")
        .unwrap()
        .into_entry(EPOCH)
        .unwrap();
    let advertisement = heard(key.key(), EPOCH);
    let aem = encrypt_metadata(&advertisement.identifier, &derive_metadata_key(key.key()), 8);
    assert_eq!(aem.to_hex(), "72033874");

    let table = KnownKeyTable::from_entries(vec![key]);
    let resolved = MatchResolver::resolve(
        &table,
        Advertisement {
            metadata: aem,
            ..advertisement
        },
    );
    assert_eq!(resolved.matched.unwrap().metadata.tx_power, 8);
}

#[test]
fn test_published_snapshot_isolates_readers() {
    let store = KnownKeyStore::default();
    let alice = TemporaryKey::generate(&mut OsRng, EPOCH);
    let bob = TemporaryKey::generate(&mut OsRng, EPOCH);

    let before = store.snapshot();
    store.append(
        KeyImport::new(*alice.secret())
            .with_label("Alice")
            .into_entry(EPOCH)
            .unwrap(),
    );
    let with_alice = store.snapshot();
    store.append(
        KeyImport::new(*bob.secret())
            .with_label("Bob")
            .into_entry(EPOCH)
            .unwrap(),
    );

    // Readers holding an older snapshot keep a consistent view
    assert!(MatchResolver::resolve(&before, heard(&alice, EPOCH)).matched.is_none());
    assert!(MatchResolver::resolve(&with_alice, heard(&bob, EPOCH)).matched.is_none());

    let latest = store.snapshot();
    assert_eq!(
        MatchResolver::resolve(&latest, heard(&bob, EPOCH.offset(9))).label(),
        Some("Bob")
    );

    // Replacing the table drops previous imports
    store.publish(KnownKeyTable::new());
    assert!(store.snapshot().is_empty());
}

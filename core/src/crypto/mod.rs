// Cryptography module: temporary keys and the identifier/metadata key schedule

pub mod derive;
pub mod keys;

pub use derive::{
    compute_identifier, decrypt_metadata, derive_metadata_key, derive_proximity_identifier_key,
    encrypt_metadata, metadata_plaintext, AssociatedMetadata, EncryptedMetadata,
    RollingProximityIdentifier, IDENTIFIER_LENGTH, METADATA_LENGTH, METADATA_VERSION_BYTE,
};
pub use keys::{
    ExportedKey, KeyError, MetadataKey, ProximityIdentifierKey, TemporaryKey, KEY_LENGTH,
};

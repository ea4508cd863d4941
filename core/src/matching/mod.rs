//! Matching of observed identifiers against imported keys
//!
//! - **import**: parse secrets received out of band (hex or base64)
//! - **known_keys**: expand each key into its 144 identifiers and publish the
//!   merged table as an atomic snapshot
//! - **resolver**: per-advertisement lookup and metadata decryption

pub mod import;
pub mod known_keys;
pub mod resolver;

pub use import::{KeyImport, DEFAULT_DEVICE_LABEL};
pub use known_keys::{KnownKeyEntry, KnownKeyStore, KnownKeyTable};
pub use resolver::{KeyMatch, MatchResolver, ResolvedAdvertisement};

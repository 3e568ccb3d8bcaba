//! Local identity keypair manager

use tracing::{debug, info, warn};

use crate::crypto::Identity;
use crate::storage::{KeyValueStore, IDENTITY_SECRET_KEY};

/// Load the persisted identity, or generate and persist a fresh one
///
/// Never fails: a missing or malformed stored secret is replaced, and a
/// failed write is logged while the new identity is still returned.
pub fn load_or_create_identity(store: &dyn KeyValueStore) -> Identity {
    if let Some(stored) = store.get(IDENTITY_SECRET_KEY) {
        match Identity::from_secret_hex(&stored) {
            Ok(identity) => {
                debug!(pubkey = %identity.public_key(), "loaded local identity");
                return identity;
            }
            Err(e) => warn!("stored identity is malformed, regenerating: {}", e),
        }
    }

    let identity = Identity::generate();
    if let Err(e) = store.set(IDENTITY_SECRET_KEY, &identity.secret_hex()) {
        warn!("failed to persist new identity: {}", e);
    }
    info!(pubkey = %identity.public_key(), "generated local identity");
    identity
}

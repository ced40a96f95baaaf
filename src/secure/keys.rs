//! Direction-scoped key derivation. The pairing/session protocol is a
//!  collaborator outside this crate; it hands over a shared secret and one
//!  32-byte random salt per side, once, at setup time.

#[cfg(test)] use mockall::automock;
use hkdf::Hkdf;
use sha2::Sha512;

pub const SALT_LEN: usize = 32;
pub const KEY_LEN: usize = 32;

const INFO_ACCESSORY_TO_CONTROLLER: &[u8] = b"DataUpload-AccessoryToController";
const INFO_CONTROLLER_TO_ACCESSORY: &[u8] = b"DataUpload-ControllerToAccessory";

/// What the pairing collaborator supplies for one connection.
#[derive(Clone)]
pub struct SessionSecret {
    pub shared_secret: Vec<u8>,
    pub local_salt: [u8; SALT_LEN],
    pub peer_salt: [u8; SALT_LEN],
}

/// Seam towards the pairing/session subsystem.
#[cfg_attr(test, automock)]
pub trait SecretSource: Send + Sync + 'static {
    fn session_secret(&self) -> SessionSecret;
}

/// Key material per supported cipher suite. Every consumer matches this
///  exhaustively, so adding a suite is a compile-visible change.
pub enum SuiteKeys {
    ChaCha20Poly1305(DirectionKeys),
}

pub struct DirectionKeys {
    pub accessory_to_controller: [u8; KEY_LEN],
    pub controller_to_accessory: [u8; KEY_LEN],
}

impl SuiteKeys {
    /// HKDF-SHA512 over the shared secret, salted with the concatenation of
    ///  both session salts (accessory salt first), one direction-specific
    ///  info string per key.
    pub fn derive(secret: &SessionSecret) -> SuiteKeys {
        let mut salt = [0u8; 2 * SALT_LEN];
        salt[..SALT_LEN].copy_from_slice(&secret.local_salt);
        salt[SALT_LEN..].copy_from_slice(&secret.peer_salt);

        let hkdf = Hkdf::<Sha512>::new(Some(&salt), &secret.shared_secret);
        let mut accessory_to_controller = [0u8; KEY_LEN];
        let mut controller_to_accessory = [0u8; KEY_LEN];
        hkdf.expand(INFO_ACCESSORY_TO_CONTROLLER, &mut accessory_to_controller)
            .expect("this is a bug: 32 bytes is a valid HKDF-SHA512 output length");
        hkdf.expand(INFO_CONTROLLER_TO_ACCESSORY, &mut controller_to_accessory)
            .expect("this is a bug: 32 bytes is a valid HKDF-SHA512 output length");

        SuiteKeys::ChaCha20Poly1305(DirectionKeys {
            accessory_to_controller,
            controller_to_accessory,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(shared: &[u8], local: u8, peer: u8) -> SessionSecret {
        SessionSecret {
            shared_secret: shared.to_vec(),
            local_salt: [local; SALT_LEN],
            peer_salt: [peer; SALT_LEN],
        }
    }

    #[test]
    fn test_directions_get_independent_keys() {
        let SuiteKeys::ChaCha20Poly1305(keys) = SuiteKeys::derive(&secret(b"shared", 1, 2));
        assert_ne!(keys.accessory_to_controller, keys.controller_to_accessory);
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let SuiteKeys::ChaCha20Poly1305(a) = SuiteKeys::derive(&secret(b"shared", 1, 2));
        let SuiteKeys::ChaCha20Poly1305(b) = SuiteKeys::derive(&secret(b"shared", 1, 2));
        assert_eq!(a.accessory_to_controller, b.accessory_to_controller);
        assert_eq!(a.controller_to_accessory, b.controller_to_accessory);
    }

    #[test]
    fn test_salts_are_not_interchangeable() {
        let SuiteKeys::ChaCha20Poly1305(a) = SuiteKeys::derive(&secret(b"shared", 1, 2));
        let SuiteKeys::ChaCha20Poly1305(b) = SuiteKeys::derive(&secret(b"shared", 2, 1));
        assert_ne!(a.accessory_to_controller, b.accessory_to_controller);
    }

    #[test]
    fn test_secret_source_seam() {
        let mut source = MockSecretSource::new();
        source
            .expect_session_secret()
            .times(1)
            .returning(|| secret(b"mocked pairing secret", 9, 10));

        let SuiteKeys::ChaCha20Poly1305(keys) = SuiteKeys::derive(&source.session_secret());
        assert_ne!(keys.accessory_to_controller, [0; KEY_LEN]);
    }

    #[test]
    fn test_secret_changes_every_key() {
        let SuiteKeys::ChaCha20Poly1305(a) = SuiteKeys::derive(&secret(b"shared", 1, 2));
        let SuiteKeys::ChaCha20Poly1305(b) = SuiteKeys::derive(&secret(b"other", 1, 2));
        assert_ne!(a.accessory_to_controller, b.accessory_to_controller);
        assert_ne!(a.controller_to_accessory, b.controller_to_accessory);
    }
}

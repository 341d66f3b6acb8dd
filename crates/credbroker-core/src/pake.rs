//! SPAKE2 handshake + the AEAD that rides on top of the derived key
//!
//! one engine handles one side (client or server) of exactly one exchange.
//! the shared secret spake2 returns becomes the AEAD key directly; both are
//! wrapped in `Zeroizing` so they are overwritten the moment the engine (or
//! an intermediate buffer) is dropped.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use spake2::{Ed25519Group, Identity, Password, Spake2};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

const SERVER_IDENTITY: &[u8] = b"credbroker:broker:v1";
const CLIENT_IDENTITY: &[u8] = b"credbroker:agent:v1";
const NONCE_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

enum State {
    Fresh,
    Started(Spake2<Ed25519Group>),
    Ready { key: Zeroizing<[u8; 32]> },
    Cleared,
}

/// one side of one SPAKE2 exchange, plus the AEAD it unlocks on success
pub struct PakeEngine {
    role: Role,
    state: State,
}

impl PakeEngine {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            state: State::Fresh,
        }
    }

    /// supply the password (pairing code) and produce the outgoing public
    /// element. `password` is zeroed in place before this returns, win or
    /// lose. must be called exactly once, before `finish`.
    pub fn start(&mut self, password: &mut [u8]) -> Result<Vec<u8>> {
        if !matches!(self.state, State::Fresh) {
            return Err(Error::ProtocolMisuse);
        }

        let pw = Password::new(&*password);
        let (spake, outgoing) = match self.role {
            Role::Server => Spake2::<Ed25519Group>::start_a(
                &pw,
                &Identity::new(SERVER_IDENTITY),
                &Identity::new(CLIENT_IDENTITY),
            ),
            Role::Client => Spake2::<Ed25519Group>::start_b(
                &pw,
                &Identity::new(SERVER_IDENTITY),
                &Identity::new(CLIENT_IDENTITY),
            ),
        };
        use zeroize::Zeroize as _;
        password.zeroize();

        self.state = State::Started(spake);
        Ok(outgoing)
    }

    /// consume the peer's public element and derive the AEAD key. must
    /// follow exactly one `start`.
    pub fn finish(&mut self, incoming: &[u8]) -> Result<()> {
        let spake = match std::mem::replace(&mut self.state, State::Cleared) {
            State::Started(spake) => spake,
            other => {
                self.state = other;
                return Err(Error::ProtocolMisuse);
            }
        };

        let mut shared = spake.finish(incoming).map_err(|_| Error::PakeFailure)?;
        if shared.len() != 32 {
            use zeroize::Zeroize as _;
            shared.zeroize();
            return Err(Error::PakeFailure);
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&shared);
        {
            use zeroize::Zeroize as _;
            shared.zeroize();
        }

        self.state = State::Ready { key };
        Ok(())
    }

    /// encrypt `plaintext` with a fresh random nonce, returning
    /// `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self.ready_key()?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key[..]).map_err(|_| Error::EncryptFailure)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::EncryptFailure)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// verify and decrypt a `nonce || ciphertext || tag` blob
    pub fn decrypt(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        let key = self.ready_key()?;
        if envelope.len() < NONCE_LEN {
            return Err(Error::DecryptFailure);
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&key[..]).map_err(|_| Error::DecryptFailure)?;
        let (nonce_bytes, ciphertext) = envelope.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::DecryptFailure)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready { .. })
    }

    /// test-only accessor: sha256 of the derived key, never the key itself
    #[cfg(any(test, feature = "test-util"))]
    pub fn key_fingerprint(&self) -> Result<[u8; 32]> {
        use sha2::{Digest, Sha256};
        let key = self.ready_key()?;
        Ok(Sha256::digest(&key[..]).into())
    }

    fn ready_key(&self) -> Result<&Zeroizing<[u8; 32]>> {
        match &self.state {
            State::Ready { key } => Ok(key),
            _ => Err(Error::NotReady),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_codes_derive_same_key() {
        let mut server = PakeEngine::new(Role::Server);
        let mut client = PakeEngine::new(Role::Client);

        let server_msg = server.start(&mut b"847293".to_vec()).unwrap();
        let client_msg = client.start(&mut b"847293".to_vec()).unwrap();

        server.finish(&client_msg).unwrap();
        client.finish(&server_msg).unwrap();

        assert!(server.is_ready());
        assert!(client.is_ready());
        assert_eq!(
            server.key_fingerprint().unwrap(),
            client.key_fingerprint().unwrap()
        );
    }

    #[test]
    fn test_distinct_codes_cannot_decrypt_each_other() {
        let mut server = PakeEngine::new(Role::Server);
        let mut client = PakeEngine::new(Role::Client);

        let server_msg = server.start(&mut b"111111".to_vec()).unwrap();
        let client_msg = client.start(&mut b"222222".to_vec()).unwrap();

        server.finish(&client_msg).unwrap();
        client.finish(&server_msg).unwrap();

        let ciphertext = client.encrypt(b"hello").unwrap();
        assert!(matches!(server.decrypt(&ciphertext), Err(Error::DecryptFailure)));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip_up_to_10kib() {
        let mut server = PakeEngine::new(Role::Server);
        let mut client = PakeEngine::new(Role::Client);
        let server_msg = server.start(&mut b"555555".to_vec()).unwrap();
        let client_msg = client.start(&mut b"555555".to_vec()).unwrap();
        server.finish(&client_msg).unwrap();
        client.finish(&server_msg).unwrap();

        for len in [0usize, 1, 16, 1024, 10 * 1024] {
            let plaintext = vec![7u8; len];
            let ciphertext = server.encrypt(&plaintext).unwrap();
            let decrypted = client.decrypt(&ciphertext).unwrap();
            assert_eq!(plaintext, decrypted);
        }
    }

    #[test]
    fn test_encrypt_is_nondeterministic() {
        let mut server = PakeEngine::new(Role::Server);
        let mut client = PakeEngine::new(Role::Client);
        let server_msg = server.start(&mut b"424242".to_vec()).unwrap();
        let client_msg = client.start(&mut b"424242".to_vec()).unwrap();
        server.finish(&client_msg).unwrap();
        client.finish(&server_msg).unwrap();

        let c1 = server.encrypt(b"same plaintext").unwrap();
        let c2 = server.encrypt(b"same plaintext").unwrap();
        assert_ne!(c1, c2);
    }

    #[test]
    fn test_truncated_ciphertext_fails() {
        let mut server = PakeEngine::new(Role::Server);
        let mut client = PakeEngine::new(Role::Client);
        let server_msg = server.start(&mut b"424242".to_vec()).unwrap();
        let client_msg = client.start(&mut b"424242".to_vec()).unwrap();
        server.finish(&client_msg).unwrap();
        client.finish(&server_msg).unwrap();

        let mut ciphertext = server.encrypt(b"hello world").unwrap();
        ciphertext.pop();
        assert!(matches!(client.decrypt(&ciphertext), Err(Error::DecryptFailure)));
    }

    #[test]
    fn test_flipped_tag_byte_fails() {
        let mut server = PakeEngine::new(Role::Server);
        let mut client = PakeEngine::new(Role::Client);
        let server_msg = server.start(&mut b"424242".to_vec()).unwrap();
        let client_msg = client.start(&mut b"424242".to_vec()).unwrap();
        server.finish(&client_msg).unwrap();
        client.finish(&server_msg).unwrap();

        let mut ciphertext = server.encrypt(b"hello world").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0x01;
        assert!(matches!(client.decrypt(&ciphertext), Err(Error::DecryptFailure)));
    }

    #[test]
    fn test_start_twice_is_protocol_misuse() {
        let mut engine = PakeEngine::new(Role::Client);
        engine.start(&mut b"123456".to_vec()).unwrap();
        assert!(matches!(
            engine.start(&mut b"123456".to_vec()),
            Err(Error::ProtocolMisuse)
        ));
    }

    #[test]
    fn test_finish_before_start_is_protocol_misuse() {
        let mut engine = PakeEngine::new(Role::Client);
        assert!(matches!(engine.finish(&[1, 2, 3]), Err(Error::ProtocolMisuse)));
    }

    #[test]
    fn test_encrypt_before_ready_is_not_ready() {
        let engine = PakeEngine::new(Role::Client);
        assert!(matches!(engine.encrypt(b"x"), Err(Error::NotReady)));
    }

    #[test]
    fn test_ciphertext_does_not_contain_plaintext_substring() {
        let mut server = PakeEngine::new(Role::Server);
        let mut client = PakeEngine::new(Role::Client);
        let server_msg = server.start(&mut b"424242".to_vec()).unwrap();
        let client_msg = client.start(&mut b"424242".to_vec()).unwrap();
        server.finish(&client_msg).unwrap();
        client.finish(&server_msg).unwrap();

        let plaintext = b"super-secret-password-1234";
        let ciphertext = server.encrypt(plaintext).unwrap();
        for window in plaintext.windows(4) {
            assert!(!ciphertext
                .windows(4)
                .any(|w| w == window));
        }
    }

    #[test]
    fn test_password_zeroed_after_start() {
        let mut engine = PakeEngine::new(Role::Client);
        let mut password = b"847293".to_vec();
        engine.start(&mut password).unwrap();
        assert_eq!(password, vec![0u8; 6]);
    }
}

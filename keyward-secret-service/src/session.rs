use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use keyward_core::{Error, Result, SecretBytes, SessionAlgorithm};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;
use zvariant::{OwnedObjectPath, Value};

use crate::bus::{Bus, convert, unwrap_variant};
use crate::crypto::{
    AES_KEY_LEN, DhKeyPair, aes128_cbc_decrypt, aes128_cbc_encrypt, derive_session_key,
    generate_dh_keypair,
};
use crate::secret::Secret;
use crate::ss::SS_SESSION_INTERFACE;

enum State {
    /// Waiting for the `OpenSession` reply. Holds our key pair for the
    /// encrypted algorithm.
    Negotiating { keypair: Option<DhKeyPair> },
    Open {
        path: OwnedObjectPath,
        /// `None` for plain sessions. Zeroized on drop.
        key: Option<Zeroizing<[u8; AES_KEY_LEN]>>,
    },
    Closed,
}

/// A client-side Secret Service session.
///
/// `encode`/`decode` hold the read lock for the duration of the crypto so a
/// concurrent `close` cannot pull the key out from under them.
pub struct Session {
    algorithm: SessionAlgorithm,
    fell_back: bool,
    bus: Option<Arc<dyn Bus>>,
    state: RwLock<State>,
}

impl Session {
    /// Start negotiating `algorithm`. Generates a DH key pair when needed.
    pub fn new(algorithm: SessionAlgorithm) -> Result<Self> {
        let keypair = if algorithm.is_encrypted() {
            Some(generate_dh_keypair()?)
        } else {
            None
        };
        Ok(Self::from_parts(algorithm, keypair))
    }

    /// Encrypted session with a caller-chosen key pair.
    #[cfg(test)]
    pub(crate) fn with_keypair(keypair: DhKeyPair) -> Self {
        Self::from_parts(SessionAlgorithm::DhIetf1024Sha256Aes128CbcPkcs7, Some(keypair))
    }

    fn from_parts(algorithm: SessionAlgorithm, keypair: Option<DhKeyPair>) -> Self {
        Self {
            algorithm,
            fell_back: false,
            bus: None,
            state: RwLock::new(State::Negotiating { keypair }),
        }
    }

    /// Remember the bus so `close` can release the remote session object.
    pub(crate) fn bind(mut self, bus: Arc<dyn Bus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub(crate) fn mark_fallback(mut self) -> Self {
        self.fell_back = true;
        self
    }

    pub fn algorithm(&self) -> SessionAlgorithm {
        self.algorithm
    }

    /// True when the encrypted algorithm was requested but the service only
    /// agreed to `plain`.
    pub fn fell_back(&self) -> bool {
        self.fell_back
    }

    pub fn path(&self) -> Option<OwnedObjectPath> {
        match &*self.read() {
            State::Open { path, .. } => Some(path.clone()),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(&*self.read(), State::Open { .. })
    }

    /// The `input` argument for `OpenSession`.
    pub fn negotiation_input(&self) -> Result<Value<'static>> {
        match &*self.read() {
            State::Negotiating { keypair: Some(kp) } => Ok(Value::from(kp.public_bytes().to_vec())),
            State::Negotiating { keypair: None } => Ok(Value::from("")),
            _ => Err(Error::SessionState),
        }
    }

    /// Complete negotiation with the `OpenSession` reply.
    ///
    /// On failure the session moves straight to `Closed`; the key pair is not
    /// reused.
    pub fn establish(&self, path: OwnedObjectPath, output: Value<'static>) -> Result<()> {
        let mut state = self.write();
        let keypair = match std::mem::replace(&mut *state, State::Closed) {
            State::Negotiating { keypair } => keypair,
            other => {
                *state = other;
                return Err(Error::SessionState);
            }
        };

        let key = match keypair {
            Some(kp) => {
                let server_public: Vec<u8> = convert(unwrap_variant(output)).map_err(|_| {
                    Error::CryptoFailure("server public key is not a byte array".to_string())
                })?;
                Some(derive_session_key(&kp, &server_public)?)
            }
            None => None,
        };

        info!(path = %path.as_str(), algorithm = %self.algorithm, "session opened");
        *state = State::Open { path, key };
        Ok(())
    }

    /// Wrap `plaintext` for transmission under this session.
    pub fn encode(&self, plaintext: &[u8], content_type: &str) -> Result<Secret> {
        let state = self.read();
        let State::Open { path, key } = &*state else {
            return Err(Error::SessionState);
        };
        let (parameters, value) = match key {
            Some(key) => aes128_cbc_encrypt(key, plaintext)?,
            None => (Vec::new(), plaintext.to_vec()),
        };
        Ok(Secret {
            session: path.clone(),
            parameters,
            value: Zeroizing::new(value),
            content_type: content_type.to_string(),
        })
    }

    /// Recover the plaintext of a secret produced for this session.
    pub fn decode(&self, secret: &Secret) -> Result<SecretBytes> {
        let state = self.read();
        let State::Open { path, key } = &*state else {
            return Err(Error::SessionState);
        };
        if secret.session != *path {
            debug!(
                expected = %path.as_str(),
                got = %secret.session.as_str(),
                "secret belongs to another session"
            );
            return Err(Error::SessionState);
        }
        match key {
            Some(key) => Ok(SecretBytes::from_zeroizing(aes128_cbc_decrypt(
                key,
                &secret.parameters,
                &secret.value,
            )?)),
            None => Ok(SecretBytes::new(secret.value.to_vec())),
        }
    }

    /// Drop the key and release the remote session object.
    ///
    /// Idempotent. The remote `Close` is best effort: the local key is gone
    /// whether or not it succeeds.
    pub async fn close(&self) {
        let path = {
            let mut state = self.write();
            match std::mem::replace(&mut *state, State::Closed) {
                State::Open { path, .. } => Some(path),
                _ => None,
            }
        };
        let Some(path) = path else {
            return;
        };
        info!(path = %path.as_str(), "session closed");
        let Some(bus) = &self.bus else {
            return;
        };
        if let Err(e) = bus
            .call(path.as_str(), SS_SESSION_INTERFACE, "Close", None)
            .await
        {
            warn!(path = %path.as_str(), error = %e, "failed to close remote session");
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (state, path) = match &*self.read() {
            State::Negotiating { .. } => ("negotiating", None),
            State::Open { path, .. } => ("open", Some(path.as_str().to_string())),
            State::Closed => ("closed", None),
        };
        f.debug_struct("Session")
            .field("algorithm", &self.algorithm)
            .field("fell_back", &self.fell_back)
            .field("state", &state)
            .field("path", &path)
            .finish()
    }
}

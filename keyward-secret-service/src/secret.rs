use std::fmt;

use keyward_core::{Error, Result};
use zeroize::Zeroizing;
use zvariant::{ObjectPath, OwnedObjectPath, Value};

use crate::bus::{Reply, convert, unwrap_variant};

/// Wire form of a secret: `(oayays)`.
pub type SecretTuple = (ObjectPath<'static>, Vec<u8>, Vec<u8>, String);

/// A secret as it travels over the bus, bound to one session.
///
/// `value` is ciphertext for encrypted sessions and plaintext for `plain`
/// ones. `parameters` holds the CBC IV, or nothing for `plain`.
pub struct Secret {
    pub session: OwnedObjectPath,
    pub parameters: Vec<u8>,
    pub value: Zeroizing<Vec<u8>>,
    pub content_type: String,
}

impl Secret {
    /// Convert to the wire tuple.
    ///
    /// The value leaves its zeroizing buffer here: `zvariant` values only
    /// hold plain owned types. For encrypted sessions this is ciphertext.
    pub fn into_wire(mut self) -> SecretTuple {
        let value = std::mem::take(&mut *self.value);
        (
            self.session.into_inner(),
            self.parameters,
            value,
            self.content_type,
        )
    }

    pub fn from_wire((session, parameters, value, content_type): SecretTuple) -> Self {
        Self {
            session: session.into(),
            parameters,
            value: Zeroizing::new(value),
            content_type,
        }
    }

    /// Parse a `(oayays)` value, accepting it with or without a variant wrapper.
    pub fn from_value(value: Value<'static>) -> Result<Self> {
        let tuple: SecretTuple = convert(unwrap_variant(value))
            .map_err(|e| Error::InvalidReply(format!("malformed secret: {e}")))?;
        Ok(Self::from_wire(tuple))
    }

    /// Read a secret that is the whole reply, either as one struct field or
    /// flattened into its four members.
    pub fn from_reply(reply: &mut Reply) -> Result<Self> {
        if reply.len() == 1 {
            return Self::from_value(reply.next_value()?);
        }
        Ok(Self::from_wire((
            reply.next()?,
            reply.next()?,
            reply.next()?,
            reply.next()?,
        )))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("session", &self.session.as_str())
            .field("parameters_len", &self.parameters.len())
            .field("value", &"[redacted]")
            .field("content_type", &self.content_type)
            .finish()
    }
}

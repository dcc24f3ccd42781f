//! The transport seam between the proxies and the message bus.
//!
//! Everything above this module speaks in object paths, interface names and
//! `zvariant` values; only [`ZbusBus`] knows about an actual connection.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use keyward_core::{Error, Result};
use tracing::{debug, warn};
use zvariant::{ObjectPath, OwnedObjectPath, Signature, Structure, Value};

use crate::ss::SS_DBUS_NAME;

/// Body fields of every signal matching a subscription, in order.
pub type SignalStream = BoxStream<'static, Vec<Value<'static>>>;

/// Minimal request/reply plus signal-subscription contract.
///
/// `args` is the method's argument list as one structure; `None` means the
/// method takes no arguments.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn call(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Option<Structure<'static>>,
    ) -> Result<Reply>;

    /// Start delivering `interface.signal` emitted by `path`.
    ///
    /// Signals emitted after this returns are guaranteed to appear on the
    /// stream; the stream ends when the connection goes away.
    async fn subscribe(&self, path: &str, interface: &str, signal: &str)
    -> Result<SignalStream>;
}

/// The ordered body fields of a method reply.
#[derive(Debug, Default)]
pub struct Reply {
    fields: VecDeque<Value<'static>>,
}

impl Reply {
    pub fn new(fields: Vec<Value<'static>>) -> Self {
        Self {
            fields: fields.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn next_value(&mut self) -> Result<Value<'static>> {
        self.fields
            .pop_front()
            .ok_or_else(|| Error::InvalidReply("reply has fewer fields than expected".to_string()))
    }

    pub fn next<T>(&mut self) -> Result<T>
    where
        T: TryFrom<Value<'static>>,
        T::Error: fmt::Display,
    {
        convert(self.next_value()?)
    }

    /// Like [`Reply::next`] but strips any variant wrapping first.
    pub fn next_variant<T>(&mut self) -> Result<T>
    where
        T: TryFrom<Value<'static>>,
        T::Error: fmt::Display,
    {
        convert(unwrap_variant(self.next_value()?))
    }

    pub fn next_path(&mut self) -> Result<OwnedObjectPath> {
        let path: ObjectPath<'static> = self.next()?;
        Ok(path.into())
    }
}

pub(crate) fn convert<T>(value: Value<'static>) -> Result<T>
where
    T: TryFrom<Value<'static>>,
    T::Error: fmt::Display,
{
    let signature = value.value_signature().to_string();
    T::try_from(value).map_err(|e| Error::InvalidReply(format!("{e} (got {signature})")))
}

/// Peel `v` wrappers until a concrete value remains.
pub fn unwrap_variant(mut value: Value<'static>) -> Value<'static> {
    while let Value::Value(inner) = value {
        value = *inner;
    }
    value
}

pub(crate) fn object_path(path: &str) -> Result<ObjectPath<'static>> {
    ObjectPath::try_from(path.to_string()).map_err(|_| Error::InvalidPath(path.to_string()))
}

/// [`Bus`] over a live `zbus` connection, addressing the Secret Service.
#[derive(Clone)]
pub struct ZbusBus {
    conn: zbus::Connection,
    destination: String,
}

impl ZbusBus {
    /// Connect to the session bus.
    pub async fn session() -> Result<Self> {
        let conn = zbus::Connection::session().await.map_err(map_zbus_error)?;
        Ok(Self::new(conn))
    }

    pub fn new(conn: zbus::Connection) -> Self {
        Self {
            conn,
            destination: SS_DBUS_NAME.to_string(),
        }
    }
}

#[async_trait]
impl Bus for ZbusBus {
    async fn call(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Option<Structure<'static>>,
    ) -> Result<Reply> {
        debug!(path, interface, method, "D-Bus call");
        let msg = match &args {
            Some(body) => {
                self.conn
                    .call_method(
                        Some(self.destination.as_str()),
                        path,
                        Some(interface),
                        method,
                        body,
                    )
                    .await
            }
            None => {
                self.conn
                    .call_method(
                        Some(self.destination.as_str()),
                        path,
                        Some(interface),
                        method,
                        &(),
                    )
                    .await
            }
        }
        .map_err(map_zbus_error)?;
        message_fields(&msg).map(Reply::new)
    }

    async fn subscribe(
        &self,
        path: &str,
        interface: &str,
        signal: &str,
    ) -> Result<SignalStream> {
        let rule = zbus::MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface(interface)
            .map_err(map_zbus_error)?
            .member(signal)
            .map_err(map_zbus_error)?
            .path(path)
            .map_err(map_zbus_error)?
            .build();
        let stream = zbus::MessageStream::for_match_rule(rule, &self.conn, None)
            .await
            .map_err(map_zbus_error)?;
        debug!(path, interface, signal, "subscribed to signal");

        let stream = stream.filter_map(|msg| async move {
            let fields = msg
                .map_err(map_zbus_error)
                .and_then(|msg| message_fields(&msg));
            match fields {
                Ok(fields) => Some(fields),
                Err(e) => {
                    warn!(error = %e, "dropping unreadable signal");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// `a{o(oayays)}`, the `GetSecrets` reply.
type SecretMap = HashMap<OwnedObjectPath, (OwnedObjectPath, Vec<u8>, Vec<u8>, String)>;

/// Split a message body into its top-level fields.
///
/// Several arguments come back as one structure signature. A single argument
/// keeps its own signature, so a lone struct argument is flattened here too.
fn message_fields(msg: &zbus::Message) -> Result<Vec<Value<'static>>> {
    let body = msg.body();
    let fields = match body.signature() {
        Signature::Unit => return Ok(Vec::new()),
        Signature::Structure(_) => body
            .deserialize::<Structure<'_>>()
            .map_err(map_zbus_error)?
            .into_fields(),
        single => vec![single_field(&body, &single.to_string())?],
    };
    fields
        .into_iter()
        .map(|field| {
            field
                .try_to_owned()
                .map(Value::from)
                .map_err(|e| Error::InvalidReply(e.to_string()))
        })
        .collect()
}

/// A lone argument only deserializes as the type its signature names.
fn single_field<'b>(body: &'b zbus::message::Body, signature: &str) -> Result<Value<'b>> {
    let value = match signature {
        "o" => Value::from(body.deserialize::<OwnedObjectPath>().map_err(map_zbus_error)?),
        "ao" => Value::from(
            body.deserialize::<Vec<OwnedObjectPath>>()
                .map_err(map_zbus_error)?,
        ),
        "a{o(oayays)}" => Value::from(body.deserialize::<SecretMap>().map_err(map_zbus_error)?),
        "s" => Value::from(body.deserialize::<String>().map_err(map_zbus_error)?),
        "b" => Value::from(body.deserialize::<bool>().map_err(map_zbus_error)?),
        "v" => body.deserialize::<Value<'_>>().map_err(map_zbus_error)?,
        other => {
            return Err(Error::InvalidReply(format!(
                "unsupported body signature {other}"
            )));
        }
    };
    Ok(value)
}

pub(crate) fn map_zbus_error(err: zbus::Error) -> Error {
    match err {
        zbus::Error::MethodError(name, message, _) => {
            Error::from_remote(name.as_str(), message.unwrap_or_default())
        }
        other => Error::bus(other.to_string()),
    }
}

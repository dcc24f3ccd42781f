use std::fmt;
use std::sync::Arc;

use keyward_core::{Attributes, Error, Result, SecretBytes};
use tracing::debug;
use zvariant::{OwnedObjectPath, Structure, Value};

use crate::bus::Bus;
use crate::prompt::{Outcome, outcome_from};
use crate::properties::Properties;
use crate::secret::Secret;
use crate::session::Session;
use crate::ss::SS_ITEM_INTERFACE;

/// Proxy for one `org.freedesktop.Secret.Item`.
#[derive(Clone)]
pub struct Item {
    bus: Arc<dyn Bus>,
    path: OwnedObjectPath,
    props: Properties,
}

impl Item {
    pub fn new(bus: Arc<dyn Bus>, path: OwnedObjectPath) -> Self {
        let props = Properties::new(Arc::clone(&bus), path.clone(), SS_ITEM_INTERFACE);
        Self { bus, path, props }
    }

    pub fn path(&self) -> &OwnedObjectPath {
        &self.path
    }

    pub async fn label(&self) -> Result<String> {
        self.props.get("Label").await
    }

    pub async fn set_label(&self, label: &str) -> Result<()> {
        self.props.set("Label", Value::from(label.to_string())).await
    }

    pub async fn attributes(&self) -> Result<Attributes> {
        self.props.get("Attributes").await
    }

    pub async fn set_attributes(&self, attributes: &Attributes) -> Result<()> {
        self.props
            .set("Attributes", Value::from(attributes.clone()))
            .await
    }

    pub async fn is_locked(&self) -> Result<bool> {
        self.props.get("Locked").await
    }

    /// Creation time, seconds since the Unix epoch.
    pub async fn created(&self) -> Result<u64> {
        self.props.get("Created").await
    }

    pub async fn modified(&self) -> Result<u64> {
        self.props.get("Modified").await
    }

    pub async fn get_secret(&self, session: &Session) -> Result<SecretBytes> {
        Ok(self.get_secret_with_type(session).await?.0)
    }

    /// Fetch and decode the secret along with its content type.
    ///
    /// Fails with [`Error::Locked`] if the item reads as locked; unlock it
    /// through the service first.
    pub async fn get_secret_with_type(&self, session: &Session) -> Result<(SecretBytes, String)> {
        if self.is_locked().await? {
            return Err(Error::Locked);
        }
        let session_path = session.path().ok_or(Error::SessionState)?;
        let args: Structure<'static> = (session_path.into_inner(),).into();
        let mut reply = self
            .bus
            .call(self.path.as_str(), SS_ITEM_INTERFACE, "GetSecret", Some(args))
            .await?;
        let secret = Secret::from_reply(&mut reply)?;
        let plaintext = session.decode(&secret)?;
        Ok((plaintext, secret.content_type.clone()))
    }

    pub async fn set_secret(&self, session: &Session, secret: &[u8], content_type: &str) -> Result<()> {
        let secret = session.encode(secret, content_type)?;
        let args: Structure<'static> = (secret.into_wire(),).into();
        self.bus
            .call(self.path.as_str(), SS_ITEM_INTERFACE, "SetSecret", Some(args))
            .await?;
        debug!(item = %self.path.as_str(), "secret updated");
        Ok(())
    }

    pub async fn delete(&self) -> Result<Outcome<()>> {
        let mut reply = self
            .bus
            .call(self.path.as_str(), SS_ITEM_INTERFACE, "Delete", None)
            .await?;
        outcome_from(reply.next_path()?, || Ok(()), |_| Ok(()))
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("path", &self.path.as_str())
            .finish()
    }
}

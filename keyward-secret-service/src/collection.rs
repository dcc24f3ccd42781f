use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use keyward_core::{Attributes, Result};
use tracing::{debug, info};
use zvariant::{ObjectPath, OwnedObjectPath, Structure, Value};

use crate::bus::{Bus, Reply, convert};
use crate::item::Item;
use crate::prompt::{Outcome, outcome_from};
use crate::properties::Properties;
use crate::session::Session;
use crate::ss::{SS_COLLECTION_INTERFACE, SS_ITEM_ATTRIBUTES, SS_ITEM_LABEL};

/// Change notifications for the items of one collection.
#[derive(Debug, Clone)]
pub enum ItemEvent {
    Created(Item),
    Changed(Item),
    /// The item no longer exists; only its path is meaningful.
    Deleted(OwnedObjectPath),
}

/// Proxy for one `org.freedesktop.Secret.Collection`.
#[derive(Clone)]
pub struct Collection {
    bus: Arc<dyn Bus>,
    path: OwnedObjectPath,
    props: Properties,
}

impl Collection {
    pub fn new(bus: Arc<dyn Bus>, path: OwnedObjectPath) -> Self {
        let props = Properties::new(Arc::clone(&bus), path.clone(), SS_COLLECTION_INTERFACE);
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

    pub async fn is_locked(&self) -> Result<bool> {
        self.props.get("Locked").await
    }

    pub async fn created(&self) -> Result<u64> {
        self.props.get("Created").await
    }

    pub async fn modified(&self) -> Result<u64> {
        self.props.get("Modified").await
    }

    pub async fn items(&self) -> Result<Vec<Item>> {
        let paths: Vec<ObjectPath<'static>> = self.props.get("Items").await?;
        Ok(self.items_from(paths))
    }

    pub async fn search_items(&self, attributes: &Attributes) -> Result<Vec<Item>> {
        let args: Structure<'static> = (attributes.clone(),).into();
        let mut reply = self
            .bus
            .call(self.path.as_str(), SS_COLLECTION_INTERFACE, "SearchItems", Some(args))
            .await?;
        let paths: Vec<ObjectPath<'static>> = reply.next()?;
        Ok(self.items_from(paths))
    }

    /// Store a new secret in this collection.
    ///
    /// With `replace`, an existing item with exactly the same attributes is
    /// overwritten instead of a second one being added.
    pub async fn create_item(
        &self,
        session: &Session,
        label: &str,
        attributes: &Attributes,
        secret: &[u8],
        content_type: &str,
        replace: bool,
    ) -> Result<Outcome<Item>> {
        let mut properties: HashMap<String, Value<'static>> = HashMap::new();
        properties.insert(SS_ITEM_LABEL.to_string(), Value::from(label.to_string()));
        properties.insert(SS_ITEM_ATTRIBUTES.to_string(), Value::from(attributes.clone()));
        let secret = session.encode(secret, content_type)?.into_wire();

        let args: Structure<'static> = (properties, secret, replace).into();
        let mut reply = self
            .bus
            .call(self.path.as_str(), SS_COLLECTION_INTERFACE, "CreateItem", Some(args))
            .await?;
        let item_path = reply.next_path()?;
        let prompt = reply.next_path()?;

        let bus = Arc::clone(&self.bus);
        let prompt_bus = Arc::clone(&self.bus);
        outcome_from(
            prompt,
            move || {
                info!(item = %item_path.as_str(), "item created");
                Ok(Item::new(bus, item_path))
            },
            move |value| {
                let path: ObjectPath<'static> = convert(value)?;
                Ok(Item::new(prompt_bus, path.into()))
            },
        )
    }

    pub async fn delete(&self) -> Result<Outcome<()>> {
        let mut reply = self
            .bus
            .call(self.path.as_str(), SS_COLLECTION_INTERFACE, "Delete", None)
            .await?;
        outcome_from(reply.next_path()?, || Ok(()), |_| Ok(()))
    }

    /// Subscribe to `ItemCreated`, `ItemChanged` and `ItemDeleted`.
    pub async fn item_events(&self) -> Result<BoxStream<'static, ItemEvent>> {
        let path = self.path.as_str();
        let mut streams = Vec::with_capacity(3);
        for signal in ["ItemCreated", "ItemChanged", "ItemDeleted"] {
            let signals = self
                .bus
                .subscribe(path, SS_COLLECTION_INTERFACE, signal)
                .await?;
            let bus = Arc::clone(&self.bus);
            let events = signals.filter_map(move |fields| {
                let event = Reply::new(fields).next_path().ok().map(|item| match signal {
                    "ItemCreated" => ItemEvent::Created(Item::new(Arc::clone(&bus), item)),
                    "ItemChanged" => ItemEvent::Changed(Item::new(Arc::clone(&bus), item)),
                    _ => ItemEvent::Deleted(item),
                });
                if event.is_none() {
                    debug!(signal, "ignoring malformed item signal");
                }
                futures_util::future::ready(event)
            });
            streams.push(events.boxed());
        }
        Ok(stream::select_all(streams).boxed())
    }

    fn items_from(&self, paths: Vec<ObjectPath<'static>>) -> Vec<Item> {
        paths
            .into_iter()
            .map(|p| Item::new(Arc::clone(&self.bus), p.into()))
            .collect()
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("path", &self.path.as_str())
            .finish()
    }
}

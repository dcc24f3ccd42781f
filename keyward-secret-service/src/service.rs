use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use keyward_core::config::ClientConfig;
use keyward_core::error_names::NOT_SUPPORTED;
use keyward_core::{Attributes, Error, Result, SecretBytes, SessionAlgorithm};
use tracing::{debug, info, warn};
use zvariant::{ObjectPath, OwnedObjectPath, Structure, Value};

use crate::bus::{Bus, Reply, ZbusBus, convert, object_path};
use crate::collection::Collection;
use crate::item::Item;
use crate::prompt::{Outcome, PromptController, outcome_from};
use crate::properties::Properties;
use crate::secret::{Secret, SecretTuple};
use crate::session::Session;
use crate::ss::{
    DEFAULT_ALIAS, NO_OBJECT, SS_COLLECTION_LABEL, SS_DBUS_PATH, SS_SERVICE_INTERFACE,
    SS_SESSION_INTERFACE, collection_path_for, is_no_object,
};

/// Items matching a search, split by lock state.
#[derive(Debug, Default)]
pub struct SearchResult {
    pub unlocked: Vec<Item>,
    pub locked: Vec<Item>,
}

/// Change notifications for the collections of the service.
#[derive(Debug, Clone)]
pub enum CollectionEvent {
    Created(Collection),
    Changed(Collection),
    /// The collection no longer exists; only its path is meaningful.
    Deleted(OwnedObjectPath),
}

/// Entry point: proxy for `org.freedesktop.Secret.Service`.
#[derive(Clone)]
pub struct SecretService {
    bus: Arc<dyn Bus>,
    config: ClientConfig,
    prompts: PromptController,
    props: Properties,
}

impl SecretService {
    /// Connect to the Secret Service on the session bus.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let bus = ZbusBus::session().await?;
        Ok(Self::with_bus(Arc::new(bus), config))
    }

    pub fn with_bus(bus: Arc<dyn Bus>, config: ClientConfig) -> Self {
        let prompts = PromptController::new(Arc::clone(&bus), config.prompt_window_id.clone());
        let props = Properties::new(
            Arc::clone(&bus),
            OwnedObjectPath::from(ObjectPath::from_static_str_unchecked(SS_DBUS_PATH)),
            SS_SERVICE_INTERFACE,
        );
        Self {
            bus,
            config,
            prompts,
            props,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn prompts(&self) -> &PromptController {
        &self.prompts
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    /// Open a session with the configured algorithm.
    pub async fn open_session(&self) -> Result<Session> {
        self.open_session_with(self.config.algorithm).await
    }

    /// Open a session, falling back to `plain` if the service does not support
    /// the encrypted algorithm and the configuration allows it.
    ///
    /// A fallback is logged and visible through [`Session::fell_back`]. Only
    /// a `NotSupported` reply triggers it; other errors are returned as-is.
    pub async fn open_session_with(&self, preferred: SessionAlgorithm) -> Result<Session> {
        match self.negotiate(Session::new(preferred)?).await {
            Ok(session) => Ok(session),
            Err(e) if preferred.is_encrypted() && e.remote_name() == Some(NOT_SUPPORTED) => {
                if !self.config.allow_plain_fallback {
                    return Err(Error::AlgorithmUnsupported(preferred.as_str().to_string()));
                }
                warn!(
                    requested = %preferred,
                    "service does not support encrypted sessions, falling back to plain"
                );
                let session = self
                    .negotiate(Session::new(SessionAlgorithm::Plain)?)
                    .await?;
                Ok(session.mark_fallback())
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn negotiate(&self, session: Session) -> Result<Session> {
        let session = session.bind(Arc::clone(&self.bus));
        let algorithm = session.algorithm();
        let args: Structure<'static> = (algorithm.as_str(), session.negotiation_input()?).into();
        let mut reply = self
            .bus
            .call(SS_DBUS_PATH, SS_SERVICE_INTERFACE, "OpenSession", Some(args))
            .await?;
        let output = reply.next_value()?;
        let path = reply.next_path()?;

        if let Err(e) = session.establish(path.clone(), output) {
            // The service already created its side; release it.
            if let Err(close_err) = self
                .bus
                .call(path.as_str(), SS_SESSION_INTERFACE, "Close", None)
                .await
            {
                warn!(path = %path.as_str(), error = %close_err, "failed to close rejected session");
            }
            return Err(e);
        }
        Ok(session)
    }

    pub async fn close_session(&self, session: &Session) {
        session.close().await;
    }

    // -----------------------------------------------------------------------
    // Collections
    // -----------------------------------------------------------------------

    pub async fn collections(&self) -> Result<Vec<Collection>> {
        let paths: Vec<ObjectPath<'static>> = self.props.get("Collections").await?;
        Ok(paths
            .into_iter()
            .map(|p| Collection::new(Arc::clone(&self.bus), p.into()))
            .collect())
    }

    pub fn collection(&self, path: &str) -> Result<Collection> {
        Ok(Collection::new(
            Arc::clone(&self.bus),
            object_path(path)?.into(),
        ))
    }

    pub fn item(&self, path: &str) -> Result<Item> {
        Ok(Item::new(Arc::clone(&self.bus), object_path(path)?.into()))
    }

    /// Create a collection, optionally registering it under `alias`.
    pub async fn create_collection(&self, label: &str, alias: &str) -> Result<Outcome<Collection>> {
        let mut properties: HashMap<String, Value<'static>> = HashMap::new();
        properties.insert(SS_COLLECTION_LABEL.to_string(), Value::from(label.to_string()));
        let args: Structure<'static> = (properties, alias.to_string()).into();
        let mut reply = self
            .bus
            .call(SS_DBUS_PATH, SS_SERVICE_INTERFACE, "CreateCollection", Some(args))
            .await?;
        let path = reply.next_path()?;
        let prompt = reply.next_path()?;

        let bus = Arc::clone(&self.bus);
        let prompt_bus = Arc::clone(&self.bus);
        outcome_from(
            prompt,
            move || {
                info!(collection = %path.as_str(), "collection created");
                Ok(Collection::new(bus, path))
            },
            move |value| {
                let path: ObjectPath<'static> = convert(value)?;
                Ok(Collection::new(prompt_bus, path.into()))
            },
        )
    }

    /// Look up an alias. `None` if the alias is not set.
    pub async fn read_alias(&self, name: &str) -> Result<Option<Collection>> {
        let args: Structure<'static> = (name.to_string(),).into();
        let mut reply = self
            .bus
            .call(SS_DBUS_PATH, SS_SERVICE_INTERFACE, "ReadAlias", Some(args))
            .await?;
        let path = reply.next_path()?;
        if is_no_object(path.as_str()) {
            return Ok(None);
        }
        Ok(Some(Collection::new(Arc::clone(&self.bus), path)))
    }

    /// Point `name` at `collection`, or remove the alias with `None`.
    pub async fn set_alias(&self, name: &str, collection: Option<&Collection>) -> Result<()> {
        let target = match collection {
            Some(c) => c.path().clone().into_inner(),
            None => ObjectPath::from_static_str_unchecked(NO_OBJECT),
        };
        let args: Structure<'static> = (name.to_string(), target).into();
        self.bus
            .call(SS_DBUS_PATH, SS_SERVICE_INTERFACE, "SetAlias", Some(args))
            .await?;
        Ok(())
    }

    pub async fn default_collection(&self) -> Result<Option<Collection>> {
        self.read_alias(DEFAULT_ALIAS).await
    }

    /// The collection named by [`ClientConfig::collection`].
    pub async fn configured_collection(&self) -> Result<Collection> {
        let name = self.config.collection.as_str();
        if name.starts_with('/') {
            return self.collection(name);
        }
        self.read_alias(name)
            .await?
            .ok_or_else(|| Error::NoSuchObject(collection_path_for(name)))
    }

    /// Subscribe to `CollectionCreated`, `CollectionChanged` and
    /// `CollectionDeleted`.
    pub async fn collection_events(&self) -> Result<BoxStream<'static, CollectionEvent>> {
        let mut streams = Vec::with_capacity(3);
        for signal in ["CollectionCreated", "CollectionChanged", "CollectionDeleted"] {
            let signals = self
                .bus
                .subscribe(SS_DBUS_PATH, SS_SERVICE_INTERFACE, signal)
                .await?;
            let bus = Arc::clone(&self.bus);
            let events = signals.filter_map(move |fields| {
                let event = Reply::new(fields).next_path().ok().map(|path| match signal {
                    "CollectionCreated" => CollectionEvent::Created(Collection::new(Arc::clone(&bus), path)),
                    "CollectionChanged" => CollectionEvent::Changed(Collection::new(Arc::clone(&bus), path)),
                    _ => CollectionEvent::Deleted(path),
                });
                if event.is_none() {
                    debug!(signal, "ignoring malformed collection signal");
                }
                futures_util::future::ready(event)
            });
            streams.push(events.boxed());
        }
        Ok(stream::select_all(streams).boxed())
    }

    // -----------------------------------------------------------------------
    // Items
    // -----------------------------------------------------------------------

    /// Find items across all collections whose attributes include `attributes`.
    pub async fn search_items(&self, attributes: &Attributes) -> Result<SearchResult> {
        let args: Structure<'static> = (attributes.clone(),).into();
        let mut reply = self
            .bus
            .call(SS_DBUS_PATH, SS_SERVICE_INTERFACE, "SearchItems", Some(args))
            .await?;
        let unlocked: Vec<ObjectPath<'static>> = reply.next()?;
        let locked: Vec<ObjectPath<'static>> = reply.next()?;
        let to_items = |paths: Vec<ObjectPath<'static>>| -> Vec<Item> {
            paths
                .into_iter()
                .map(|p| Item::new(Arc::clone(&self.bus), p.into()))
                .collect()
        };
        Ok(SearchResult {
            unlocked: to_items(unlocked),
            locked: to_items(locked),
        })
    }

    /// Fetch several secrets in one round trip.
    ///
    /// Locked items are silently left out by the service.
    pub async fn get_secrets(
        &self,
        items: &[Item],
        session: &Session,
    ) -> Result<HashMap<OwnedObjectPath, SecretBytes>> {
        let session_path = session.path().ok_or(Error::SessionState)?;
        let args: Structure<'static> = (to_paths(items.iter().map(Item::path)), session_path.into_inner()).into();
        let mut reply = self
            .bus
            .call(SS_DBUS_PATH, SS_SERVICE_INTERFACE, "GetSecrets", Some(args))
            .await?;
        let secrets: HashMap<ObjectPath<'static>, SecretTuple> = reply.next()?;

        let mut out = HashMap::with_capacity(secrets.len());
        for (path, tuple) in secrets {
            let secret = Secret::from_wire(tuple);
            out.insert(path.into(), session.decode(&secret)?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Locking
    // -----------------------------------------------------------------------

    /// Unlock collections or items. The prompt result is merged with whatever
    /// the service unlocked immediately.
    pub async fn unlock(&self, objects: &[OwnedObjectPath]) -> Result<Outcome<Vec<OwnedObjectPath>>> {
        self.lock_or_unlock("Unlock", objects).await
    }

    pub async fn lock(&self, objects: &[OwnedObjectPath]) -> Result<Outcome<Vec<OwnedObjectPath>>> {
        self.lock_or_unlock("Lock", objects).await
    }

    async fn lock_or_unlock(
        &self,
        method: &'static str,
        objects: &[OwnedObjectPath],
    ) -> Result<Outcome<Vec<OwnedObjectPath>>> {
        let args: Structure<'static> = (to_paths(objects.iter()),).into();
        let mut reply = self
            .bus
            .call(SS_DBUS_PATH, SS_SERVICE_INTERFACE, method, Some(args))
            .await?;
        let done: Vec<ObjectPath<'static>> = reply.next()?;
        let done: Vec<OwnedObjectPath> = done.into_iter().map(Into::into).collect();
        let prompt = reply.next_path()?;
        info!(method, immediate = done.len(), prompted = !is_no_object(prompt.as_str()), "lock state change");

        let immediate = done.clone();
        outcome_from(
            prompt,
            move || Ok(done),
            move |value| {
                let prompted: Vec<ObjectPath<'static>> = convert(value)?;
                let mut all = immediate;
                all.extend(prompted.into_iter().map(OwnedObjectPath::from));
                Ok(all)
            },
        )
    }
}

fn to_paths<'a>(paths: impl Iterator<Item = &'a OwnedObjectPath>) -> Vec<ObjectPath<'static>> {
    paths.map(|p| p.clone().into_inner()).collect()
}

impl fmt::Debug for SecretService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretService")
            .field("config", &self.config)
            .field("pending_prompts", &self.prompts.pending_count())
            .finish()
    }
}

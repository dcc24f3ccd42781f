//! In-memory Secret Service daemon implementing [`Bus`] for unit tests.
//!
//! It runs the real server half of the DH negotiation (with a fixed key pair)
//! and real AES, so tests exercise the client crypto end to end.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use keyward_core::error_names::{IS_LOCKED, NO_SESSION, NO_SUCH_OBJECT, NOT_SUPPORTED};
use keyward_core::{Attributes, Error, Result};
use tokio::sync::mpsc;
use zvariant::{ObjectPath, OwnedValue, Structure, Value};

use crate::bus::{Bus, Reply, SignalStream, unwrap_variant};
use crate::crypto::tests::{SERVER_EXPONENT, fixed_keypair};
use crate::crypto::{AES_KEY_LEN, DhKeyPair, aes128_cbc_decrypt, aes128_cbc_encrypt, derive_session_key};
use crate::secret::{Secret, SecretTuple};
use crate::ss::*;

pub(crate) const LOGIN_COLLECTION: &str = "/org/freedesktop/secrets/collection/login";

const COLLECTION_PREFIX: &str = "/org/freedesktop/secrets/collection/";
const SESSION_PREFIX: &str = "/org/freedesktop/secrets/session/";

/// What the daemon does when a client calls `Prompt()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PromptBehavior {
    /// Perform the action and emit `Completed(false, result)`.
    Complete,
    /// Emit `Completed(true, "")`.
    Dismiss,
    /// Emit nothing; use [`StubDaemon::complete_prompt`] to finish it.
    Ignore,
}

type PromptAction = Box<dyn FnOnce(&mut State) -> Value<'static> + Send>;

struct StubCollection {
    label: String,
    locked: bool,
    created: u64,
    modified: u64,
}

struct StubItem {
    collection: String,
    label: String,
    attributes: Attributes,
    secret: Vec<u8>,
    content_type: String,
    created: u64,
    modified: u64,
}

struct Signal {
    path: String,
    interface: &'static str,
    member: &'static str,
    fields: Vec<Value<'static>>,
}

struct State {
    supports_dh: bool,
    prompt_behavior: PromptBehavior,
    prompt_on_delete: bool,
    prompt_on_create_collection: bool,
    clock: u64,
    next_id: u64,
    sessions: HashMap<String, Option<[u8; AES_KEY_LEN]>>,
    collections: BTreeMap<String, StubCollection>,
    items: BTreeMap<String, StubItem>,
    aliases: HashMap<String, String>,
    prompts: HashMap<String, PromptAction>,
    calls: Vec<(String, String)>,
    last_window_id: Option<String>,
    /// Signals produced while handling a call, emitted after the state lock
    /// is released.
    outbox: Vec<Signal>,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn resolve_alias(&self, path: &str) -> String {
        path.strip_prefix(SS_ALIAS_PREFIX)
            .and_then(|alias| self.aliases.get(alias))
            .cloned()
            .unwrap_or_else(|| path.to_string())
    }

    fn item_locked(&self, path: &str) -> bool {
        self.items
            .get(path)
            .and_then(|i| self.collections.get(&i.collection))
            .is_some_and(|c| c.locked)
    }

    fn object_locked(&self, path: &str) -> bool {
        match self.collections.get(path) {
            Some(c) => c.locked,
            None => self.item_locked(path),
        }
    }

    fn collection_of(&self, path: &str) -> Option<String> {
        if self.collections.contains_key(path) {
            Some(path.to_string())
        } else {
            self.items.get(path).map(|i| i.collection.clone())
        }
    }

    fn signal(&mut self, path: &str, interface: &'static str, member: &'static str, fields: Vec<Value<'static>>) {
        self.outbox.push(Signal {
            path: path.to_string(),
            interface,
            member,
            fields,
        });
    }

    fn collection_signal(&mut self, member: &'static str, collection: &str) {
        self.signal(SS_DBUS_PATH, SS_SERVICE_INTERFACE, member, vec![path_value(collection)]);
    }

    fn item_signal(&mut self, member: &'static str, item: &str) {
        if let Some(collection) = self.items.get(item).map(|i| i.collection.clone()) {
            self.signal(&collection, SS_COLLECTION_INTERFACE, member, vec![path_value(item)]);
        }
    }

    fn new_prompt(&mut self, action: PromptAction) -> String {
        let path = format!("{SS_PROMPT_PREFIX}p{}", self.next_id());
        self.prompts.insert(path.clone(), action);
        path
    }

    fn create_collection(&mut self, label: &str, alias: &str) -> String {
        let mut name: String = label
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        if name.is_empty() || self.collections.contains_key(&format!("{COLLECTION_PREFIX}{name}")) {
            name = format!("{name}_{}", self.next_id());
        }
        let path = format!("{COLLECTION_PREFIX}{name}");
        let now = self.tick();
        self.collections.insert(
            path.clone(),
            StubCollection {
                label: label.to_string(),
                locked: false,
                created: now,
                modified: now,
            },
        );
        if !alias.is_empty() {
            self.aliases.insert(alias.to_string(), path.clone());
        }
        self.collection_signal("CollectionCreated", &path);
        path
    }

    fn delete_item(&mut self, path: &str) {
        self.item_signal("ItemDeleted", path);
        self.items.remove(path);
    }

    fn delete_collection(&mut self, path: &str) {
        let items: Vec<String> = self
            .items
            .iter()
            .filter(|(_, i)| i.collection == path)
            .map(|(p, _)| p.clone())
            .collect();
        for item in items {
            self.delete_item(&item);
        }
        self.collections.remove(path);
        self.aliases.retain(|_, target| target != path);
        self.collection_signal("CollectionDeleted", path);
    }

    fn search(&self, attributes: &Attributes) -> Vec<String> {
        self.items
            .iter()
            .filter(|(_, item)| {
                attributes
                    .iter()
                    .all(|(k, v)| item.attributes.get(k) == Some(v))
            })
            .map(|(p, _)| p.clone())
            .collect()
    }

    fn session_key(&self, session: &str) -> Result<Option<[u8; AES_KEY_LEN]>> {
        self.sessions
            .get(session)
            .copied()
            .ok_or_else(|| remote(NO_SESSION, "no such session"))
    }

    fn encode_secret(&self, session: &str, item: &StubItem) -> Result<SecretTuple> {
        let (parameters, value) = match self.session_key(session)? {
            Some(key) => aes128_cbc_encrypt(&key, &item.secret)?,
            None => (Vec::new(), item.secret.clone()),
        };
        Ok((
            object_path(session),
            parameters,
            value,
            item.content_type.clone(),
        ))
    }

    fn decode_secret(&self, value: Value<'static>) -> Result<(Vec<u8>, String)> {
        let secret = Secret::from_value(value)?;
        let plaintext = match self.session_key(secret.session.as_str())? {
            Some(key) => aes128_cbc_decrypt(&key, &secret.parameters, &secret.value)?.to_vec(),
            None => secret.value.to_vec(),
        };
        Ok((plaintext, secret.content_type.clone()))
    }
}

struct Subscriber {
    path: String,
    interface: String,
    member: String,
    tx: mpsc::UnboundedSender<Vec<Value<'static>>>,
}

pub(crate) struct StubDaemon {
    state: Mutex<State>,
    subscribers: Mutex<Vec<Subscriber>>,
    server_keypair: DhKeyPair,
}

impl StubDaemon {
    /// A daemon with one unlocked collection, `login`, aliased as `default`.
    pub(crate) fn new() -> Arc<Self> {
        let mut state = State {
            supports_dh: true,
            prompt_behavior: PromptBehavior::Complete,
            prompt_on_delete: false,
            prompt_on_create_collection: false,
            clock: 1_700_000_000,
            next_id: 0,
            sessions: HashMap::new(),
            collections: BTreeMap::new(),
            items: BTreeMap::new(),
            aliases: HashMap::new(),
            prompts: HashMap::new(),
            calls: Vec::new(),
            last_window_id: None,
            outbox: Vec::new(),
        };
        state.create_collection("Login", DEFAULT_ALIAS);
        state.outbox.clear();
        Arc::new(Self {
            state: Mutex::new(state),
            subscribers: Mutex::new(Vec::new()),
            server_keypair: fixed_keypair(SERVER_EXPONENT),
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let (result, outbox) = {
            let mut state = self.state.lock().unwrap();
            let result = f(&mut state);
            (result, std::mem::take(&mut state.outbox))
        };
        for signal in outbox {
            self.emit(signal);
        }
        result
    }

    fn emit(&self, signal: Signal) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|s| !s.tx.is_closed());
        for s in subscribers.iter() {
            if s.path == signal.path && s.interface == signal.interface && s.member == signal.member {
                let fields = signal.fields.iter().map(|v| v.try_clone().unwrap()).collect();
                let _ = s.tx.send(fields);
            }
        }
    }

    pub(crate) fn server_public_key(&self) -> &[u8] {
        self.server_keypair.public_bytes()
    }

    pub(crate) fn set_supports_dh(&self, supported: bool) {
        self.with_state(|s| s.supports_dh = supported);
    }

    pub(crate) fn set_prompt_behavior(&self, behavior: PromptBehavior) {
        self.with_state(|s| s.prompt_behavior = behavior);
    }

    pub(crate) fn set_prompt_on_delete(&self, enabled: bool) {
        self.with_state(|s| s.prompt_on_delete = enabled);
    }

    pub(crate) fn set_prompt_on_create_collection(&self, enabled: bool) {
        self.with_state(|s| s.prompt_on_create_collection = enabled);
    }

    pub(crate) fn set_locked(&self, collection: &str, locked: bool) {
        self.with_state(|s| {
            if let Some(c) = s.collections.get_mut(collection) {
                c.locked = locked;
            }
        });
    }

    pub(crate) fn has_collection(&self, path: &str) -> bool {
        self.with_state(|s| s.collections.contains_key(path))
    }

    pub(crate) fn add_item(&self, collection: &str, label: &str, attributes: Attributes, secret: &[u8]) -> String {
        self.with_state(|s| {
            let path = format!("{collection}/{}", s.next_id());
            let now = s.tick();
            s.items.insert(
                path.clone(),
                StubItem {
                    collection: collection.to_string(),
                    label: label.to_string(),
                    attributes,
                    secret: secret.to_vec(),
                    content_type: DEFAULT_CONTENT_TYPE.to_string(),
                    created: now,
                    modified: now,
                },
            );
            path
        })
    }

    pub(crate) fn rename_item(&self, path: &str, label: &str) {
        self.with_state(|s| {
            let now = s.tick();
            if let Some(item) = s.items.get_mut(path) {
                item.label = label.to_string();
                item.modified = now;
            }
        });
    }

    pub(crate) fn stored_secret(&self, item: &str) -> Option<Vec<u8>> {
        self.with_state(|s| s.items.get(item).map(|i| i.secret.clone()))
    }

    pub(crate) fn session_key(&self, session: &str) -> Option<[u8; AES_KEY_LEN]> {
        self.with_state(|s| s.sessions.get(session).copied().flatten())
    }

    pub(crate) fn open_sessions(&self) -> usize {
        self.with_state(|s| s.sessions.len())
    }

    /// Register a prompt whose completion result is `result`.
    pub(crate) fn add_prompt(&self, result: Value<'static>) -> zvariant::OwnedObjectPath {
        let path = self.with_state(|s| s.new_prompt(Box::new(move |_: &mut State| result)));
        object_path(&path).into()
    }

    /// Finish a pending prompt as if the user had accepted it.
    pub(crate) fn complete_prompt(&self, path: &str) {
        self.with_state(|s| {
            if let Some(action) = s.prompts.remove(path) {
                let result = action(s);
                s.signal(path, SS_PROMPT_INTERFACE, "Completed", completed(false, result));
            }
        });
    }

    pub(crate) fn pending_prompts(&self) -> Vec<String> {
        self.with_state(|s| s.prompts.keys().cloned().collect())
    }

    pub(crate) fn calls(&self) -> Vec<(String, String)> {
        self.with_state(|s| s.calls.clone())
    }

    pub(crate) fn was_called(&self, method: &str, path: &str) -> bool {
        self.with_state(|s| s.calls.iter().any(|(m, p)| m == method && p == path))
    }

    pub(crate) fn last_window_id(&self) -> Option<String> {
        self.with_state(|s| s.last_window_id.clone())
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }

    /// Drop every signal subscription, as a lost connection would.
    pub(crate) fn disconnect_signals(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    fn handle(&self, state: &mut State, path: &str, interface: &str, method: &str, mut args: Reply) -> Result<Vec<Value<'static>>> {
        state.calls.push((method.to_string(), path.to_string()));
        let path = state.resolve_alias(path);
        let path = path.as_str();

        match (interface, method) {
            (SS_SERVICE_INTERFACE, "OpenSession") => {
                let algorithm: String = args.next()?;
                let input = unwrap_variant(args.next_value()?);
                let session = format!("{SESSION_PREFIX}s{}", uuid::Uuid::new_v4().simple());
                match algorithm.as_str() {
                    "plain" => {
                        state.sessions.insert(session.clone(), None);
                        Ok(vec![variant(Value::from("")), path_value(&session)])
                    }
                    "dh-ietf1024-sha256-aes128-cbc-pkcs7" if state.supports_dh => {
                        let client_public: Vec<u8> = crate::bus::convert(input)?;
                        let key = derive_session_key(&self.server_keypair, &client_public)?;
                        state.sessions.insert(session.clone(), Some(*key));
                        Ok(vec![
                            variant(Value::from(self.server_keypair.public_bytes().to_vec())),
                            path_value(&session),
                        ])
                    }
                    other => Err(remote(NOT_SUPPORTED, &format!("algorithm {other} not supported"))),
                }
            }
            (SS_SESSION_INTERFACE, "Close") => {
                state.sessions.remove(path);
                Ok(Vec::new())
            }
            (SS_SERVICE_INTERFACE, "SearchItems") => {
                let attributes: Attributes = args.next()?;
                let (locked, unlocked): (Vec<String>, Vec<String>) = state
                    .search(&attributes)
                    .into_iter()
                    .partition(|p| state.item_locked(p));
                Ok(vec![paths_value(&unlocked), paths_value(&locked)])
            }
            (SS_SERVICE_INTERFACE, "Unlock") | (SS_SERVICE_INTERFACE, "Lock") => {
                let objects: Vec<ObjectPath<'static>> = args.next()?;
                let objects: Vec<String> = objects.iter().map(|p| state.resolve_alias(p.as_str())).collect();
                if method == "Lock" {
                    for object in &objects {
                        if let Some(c) = state.collection_of(object) {
                            if let Some(c) = state.collections.get_mut(&c) {
                                c.locked = true;
                            }
                        }
                    }
                    return Ok(vec![paths_value(&objects), path_value(NO_OBJECT)]);
                }
                let (pending, done): (Vec<String>, Vec<String>) =
                    objects.into_iter().partition(|p| state.object_locked(p));
                if pending.is_empty() {
                    return Ok(vec![paths_value(&done), path_value(NO_OBJECT)]);
                }
                let prompt = state.new_prompt(Box::new(move |s: &mut State| {
                    for object in &pending {
                        if let Some(c) = s.collection_of(object) {
                            if let Some(c) = s.collections.get_mut(&c) {
                                c.locked = false;
                            }
                        }
                    }
                    paths_value(&pending)
                }));
                Ok(vec![paths_value(&done), path_value(&prompt)])
            }
            (SS_SERVICE_INTERFACE, "GetSecrets") => {
                let items: Vec<ObjectPath<'static>> = args.next()?;
                let session: ObjectPath<'static> = args.next()?;
                let mut out: HashMap<ObjectPath<'static>, SecretTuple> = HashMap::new();
                for item in items {
                    if state.item_locked(item.as_str()) {
                        continue;
                    }
                    if let Some(stored) = state.items.get(item.as_str()) {
                        let secret = state.encode_secret(session.as_str(), stored)?;
                        out.insert(item, secret);
                    }
                }
                Ok(vec![Value::from(out)])
            }
            (SS_SERVICE_INTERFACE, "ReadAlias") => {
                let name: String = args.next()?;
                let target = state.aliases.get(&name).cloned().unwrap_or_else(|| NO_OBJECT.to_string());
                Ok(vec![path_value(&target)])
            }
            (SS_SERVICE_INTERFACE, "SetAlias") => {
                let name: String = args.next()?;
                let target: ObjectPath<'static> = args.next()?;
                if is_no_object(target.as_str()) {
                    state.aliases.remove(&name);
                } else {
                    state.aliases.insert(name, target.to_string());
                }
                Ok(Vec::new())
            }
            (SS_SERVICE_INTERFACE, "CreateCollection") => {
                let mut properties: HashMap<String, OwnedValue> = args.next()?;
                let alias: String = args.next()?;
                let label: String = take_property(&mut properties, SS_COLLECTION_LABEL)?.unwrap_or_default();
                if state.prompt_on_create_collection {
                    let prompt = state.new_prompt(Box::new(move |s: &mut State| {
                        path_value(&s.create_collection(&label, &alias))
                    }));
                    return Ok(vec![path_value(NO_OBJECT), path_value(&prompt)]);
                }
                let created = state.create_collection(&label, &alias);
                Ok(vec![path_value(&created), path_value(NO_OBJECT)])
            }
            (SS_COLLECTION_INTERFACE, "SearchItems") => {
                let attributes: Attributes = args.next()?;
                require_collection(state, path)?;
                let found: Vec<String> = state
                    .search(&attributes)
                    .into_iter()
                    .filter(|p| state.items.get(p).is_some_and(|i| i.collection == path))
                    .collect();
                Ok(vec![paths_value(&found)])
            }
            (SS_COLLECTION_INTERFACE, "CreateItem") => {
                require_collection(state, path)?;
                if state.object_locked(path) {
                    return Err(remote(IS_LOCKED, "collection is locked"));
                }
                let mut properties: HashMap<String, OwnedValue> = args.next()?;
                let secret = args.next_value()?;
                let replace: bool = args.next()?;
                let label: String = take_property(&mut properties, SS_ITEM_LABEL)?.unwrap_or_default();
                let attributes: Attributes =
                    take_property(&mut properties, SS_ITEM_ATTRIBUTES)?.unwrap_or_default();
                let (plaintext, content_type) = state.decode_secret(secret)?;

                let existing = if replace {
                    state
                        .items
                        .iter()
                        .find(|(_, i)| i.collection == path && i.attributes == attributes)
                        .map(|(p, _)| p.clone())
                } else {
                    None
                };
                let now = state.tick();
                let item_path = match existing {
                    Some(existing) => {
                        if let Some(item) = state.items.get_mut(&existing) {
                            item.label = label;
                            item.secret = plaintext;
                            item.content_type = content_type;
                            item.modified = now;
                        }
                        state.item_signal("ItemChanged", &existing);
                        existing
                    }
                    None => {
                        let item_path = format!("{path}/{}", state.next_id());
                        state.items.insert(
                            item_path.clone(),
                            StubItem {
                                collection: path.to_string(),
                                label,
                                attributes,
                                secret: plaintext,
                                content_type,
                                created: now,
                                modified: now,
                            },
                        );
                        state.item_signal("ItemCreated", &item_path);
                        item_path
                    }
                };
                Ok(vec![path_value(&item_path), path_value(NO_OBJECT)])
            }
            (SS_COLLECTION_INTERFACE, "Delete") => {
                require_collection(state, path)?;
                let target = path.to_string();
                if state.prompt_on_delete {
                    let prompt = state.new_prompt(Box::new(move |s: &mut State| {
                        s.delete_collection(&target);
                        Value::from("")
                    }));
                    return Ok(vec![path_value(&prompt)]);
                }
                state.delete_collection(&target);
                Ok(vec![path_value(NO_OBJECT)])
            }
            (SS_ITEM_INTERFACE, "GetSecret") => {
                let session: ObjectPath<'static> = args.next()?;
                let item = require_item(state, path)?;
                if state.item_locked(path) {
                    return Err(remote(IS_LOCKED, "item is locked"));
                }
                Ok(vec![Value::from(state.encode_secret(session.as_str(), item)?)])
            }
            (SS_ITEM_INTERFACE, "SetSecret") => {
                require_item(state, path)?;
                if state.item_locked(path) {
                    return Err(remote(IS_LOCKED, "item is locked"));
                }
                let (plaintext, content_type) = state.decode_secret(args.next_value()?)?;
                let now = state.tick();
                if let Some(item) = state.items.get_mut(path) {
                    item.secret = plaintext;
                    item.content_type = content_type;
                    item.modified = now;
                }
                state.item_signal("ItemChanged", path);
                Ok(Vec::new())
            }
            (SS_ITEM_INTERFACE, "Delete") => {
                require_item(state, path)?;
                let target = path.to_string();
                if state.prompt_on_delete {
                    let prompt = state.new_prompt(Box::new(move |s: &mut State| {
                        s.delete_item(&target);
                        Value::from("")
                    }));
                    return Ok(vec![path_value(&prompt)]);
                }
                state.delete_item(&target);
                Ok(vec![path_value(NO_OBJECT)])
            }
            (SS_PROMPT_INTERFACE, "Prompt") => {
                let window_id: String = args.next()?;
                state.last_window_id = Some(window_id);
                if !state.prompts.contains_key(path) {
                    return Err(remote(NO_SUCH_OBJECT, path));
                }
                match state.prompt_behavior {
                    PromptBehavior::Complete => {
                        if let Some(action) = state.prompts.remove(path) {
                            let result = action(state);
                            state.signal(path, SS_PROMPT_INTERFACE, "Completed", completed(false, result));
                        }
                    }
                    PromptBehavior::Dismiss => {
                        state.prompts.remove(path);
                        state.signal(path, SS_PROMPT_INTERFACE, "Completed", completed(true, Value::from("")));
                    }
                    PromptBehavior::Ignore => {}
                }
                Ok(Vec::new())
            }
            (SS_PROMPT_INTERFACE, "Dismiss") => {
                if state.prompts.remove(path).is_some() {
                    state.signal(path, SS_PROMPT_INTERFACE, "Completed", completed(true, Value::from("")));
                }
                Ok(Vec::new())
            }
            (DBUS_PROPERTIES_INTERFACE, "Get") => {
                let _interface: String = args.next()?;
                let name: String = args.next()?;
                Ok(vec![variant(get_property(state, path, &name)?)])
            }
            (DBUS_PROPERTIES_INTERFACE, "Set") => {
                let _interface: String = args.next()?;
                let name: String = args.next()?;
                let value = unwrap_variant(args.next_value()?);
                set_property(state, path, &name, value)?;
                Ok(Vec::new())
            }
            _ => Err(remote(
                "org.freedesktop.DBus.Error.UnknownMethod",
                &format!("{interface}.{method}"),
            )),
        }
    }
}

#[async_trait]
impl Bus for StubDaemon {
    async fn call(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        args: Option<Structure<'static>>,
    ) -> Result<Reply> {
        let args = Reply::new(args.map(Structure::into_fields).unwrap_or_default());
        let fields = self.with_state(|state| self.handle(state, path, interface, method, args))?;
        Ok(Reply::new(fields))
    }

    async fn subscribe(&self, path: &str, interface: &str, signal: &str) -> Result<SignalStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(Subscriber {
            path: path.to_string(),
            interface: interface.to_string(),
            member: signal.to_string(),
            tx,
        });
        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|fields| (fields, rx))
        });
        Ok(stream.boxed())
    }
}

fn get_property(state: &State, path: &str, name: &str) -> Result<Value<'static>> {
    if path == SS_DBUS_PATH && name == "Collections" {
        let paths: Vec<String> = state.collections.keys().cloned().collect();
        return Ok(paths_value(&paths));
    }
    if let Some(c) = state.collections.get(path) {
        return match name {
            "Label" => Ok(Value::from(c.label.clone())),
            "Locked" => Ok(Value::from(c.locked)),
            "Created" => Ok(Value::from(c.created)),
            "Modified" => Ok(Value::from(c.modified)),
            "Items" => {
                let items: Vec<String> = state
                    .items
                    .iter()
                    .filter(|(_, i)| i.collection == path)
                    .map(|(p, _)| p.clone())
                    .collect();
                Ok(paths_value(&items))
            }
            _ => Err(unknown_property(name)),
        };
    }
    let item = require_item(state, path)?;
    match name {
        "Label" => Ok(Value::from(item.label.clone())),
        "Attributes" => Ok(Value::from(item.attributes.clone())),
        "Locked" => Ok(Value::from(state.item_locked(path))),
        "Created" => Ok(Value::from(item.created)),
        "Modified" => Ok(Value::from(item.modified)),
        _ => Err(unknown_property(name)),
    }
}

fn set_property(state: &mut State, path: &str, name: &str, value: Value<'static>) -> Result<()> {
    let now = state.tick();
    if let Some(c) = state.collections.get_mut(path) {
        return match name {
            "Label" => {
                c.label = crate::bus::convert(value)?;
                c.modified = now;
                state.collection_signal("CollectionChanged", path);
                Ok(())
            }
            _ => Err(unknown_property(name)),
        };
    }
    require_item(state, path)?;
    let Some(item) = state.items.get_mut(path) else {
        return Err(remote(NO_SUCH_OBJECT, path));
    };
    match name {
        "Label" => item.label = crate::bus::convert(value)?,
        "Attributes" => item.attributes = crate::bus::convert(value)?,
        _ => return Err(unknown_property(name)),
    }
    item.modified = now;
    state.item_signal("ItemChanged", path);
    Ok(())
}

fn take_property<T>(properties: &mut HashMap<String, OwnedValue>, key: &str) -> Result<Option<T>>
where
    T: TryFrom<Value<'static>>,
    T::Error: std::fmt::Display,
{
    properties
        .remove(key)
        .map(|v| crate::bus::convert(unwrap_variant(Value::from(v))))
        .transpose()
}

fn require_collection(state: &State, path: &str) -> Result<()> {
    if state.collections.contains_key(path) {
        Ok(())
    } else {
        Err(remote(NO_SUCH_OBJECT, path))
    }
}

fn require_item<'s>(state: &'s State, path: &str) -> Result<&'s StubItem> {
    state
        .items
        .get(path)
        .ok_or_else(|| remote(NO_SUCH_OBJECT, path))
}

fn unknown_property(name: &str) -> Error {
    remote("org.freedesktop.DBus.Error.UnknownProperty", name)
}

fn remote(name: &str, message: &str) -> Error {
    Error::from_remote(name, message)
}

fn completed(dismissed: bool, result: Value<'static>) -> Vec<Value<'static>> {
    vec![Value::from(dismissed), variant(result)]
}

fn variant(value: Value<'static>) -> Value<'static> {
    Value::Value(Box::new(value))
}

fn object_path(path: &str) -> ObjectPath<'static> {
    ObjectPath::try_from(path.to_string()).unwrap()
}

fn path_value(path: &str) -> Value<'static> {
    Value::from(object_path(path))
}

fn paths_value(paths: &[String]) -> Value<'static> {
    let paths: Vec<ObjectPath<'static>> = paths.iter().map(|p| object_path(p)).collect();
    Value::from(paths)
}

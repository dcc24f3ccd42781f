//! Well-known names of the freedesktop Secret Service D-Bus API.

pub const SS_DBUS_NAME: &str = "org.freedesktop.secrets";
pub const SS_DBUS_PATH: &str = "/org/freedesktop/secrets";

pub const SS_SERVICE_INTERFACE: &str = "org.freedesktop.Secret.Service";
pub const SS_COLLECTION_INTERFACE: &str = "org.freedesktop.Secret.Collection";
pub const SS_ITEM_INTERFACE: &str = "org.freedesktop.Secret.Item";
pub const SS_SESSION_INTERFACE: &str = "org.freedesktop.Secret.Session";
pub const SS_PROMPT_INTERFACE: &str = "org.freedesktop.Secret.Prompt";
pub const DBUS_PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

pub const SS_ITEM_LABEL: &str = "org.freedesktop.Secret.Item.Label";
pub const SS_ITEM_ATTRIBUTES: &str = "org.freedesktop.Secret.Item.Attributes";
pub const SS_COLLECTION_LABEL: &str = "org.freedesktop.Secret.Collection.Label";

pub const SS_ALIAS_PREFIX: &str = "/org/freedesktop/secrets/aliases/";
pub const SS_PROMPT_PREFIX: &str = "/org/freedesktop/secrets/prompt/";

pub const DEFAULT_ALIAS: &str = "default";

/// The "no object" path used by the API for "no prompt" and "no alias".
pub const NO_OBJECT: &str = "/";

pub const DEFAULT_CONTENT_TYPE: &str = "text/plain";

pub fn is_no_object(path: &str) -> bool {
    path == NO_OBJECT
}

/// Resolve a configured collection name to an object path.
///
/// Full object paths pass through unchanged; anything else is treated as an
/// alias name.
pub fn collection_path_for(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("{SS_ALIAS_PREFIX}{name}")
    }
}

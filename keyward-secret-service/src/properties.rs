use std::fmt;
use std::sync::Arc;

use keyward_core::Result;
use tracing::debug;
use zvariant::{OwnedObjectPath, Structure, Value};

use crate::bus::Bus;
use crate::ss::DBUS_PROPERTIES_INTERFACE;

/// `org.freedesktop.DBus.Properties` access for one object and interface.
///
/// Nothing is cached: each `get` is a round trip, so values reflect the
/// daemon's state at the time of the call.
#[derive(Clone)]
pub struct Properties {
    bus: Arc<dyn Bus>,
    path: OwnedObjectPath,
    interface: &'static str,
}

impl Properties {
    pub fn new(bus: Arc<dyn Bus>, path: OwnedObjectPath, interface: &'static str) -> Self {
        Self {
            bus,
            path,
            interface,
        }
    }

    pub async fn get<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<Value<'static>>,
        T::Error: fmt::Display,
    {
        let args: Structure<'static> = (self.interface, name.to_string()).into();
        let mut reply = self
            .bus
            .call(self.path.as_str(), DBUS_PROPERTIES_INTERFACE, "Get", Some(args))
            .await?;
        reply.next_variant()
    }

    pub async fn set(&self, name: &str, value: Value<'static>) -> Result<()> {
        debug!(path = %self.path.as_str(), property = name, "setting property");
        let args: Structure<'static> = (self.interface, name.to_string(), value).into();
        self.bus
            .call(self.path.as_str(), DBUS_PROPERTIES_INTERFACE, "Set", Some(args))
            .await?;
        Ok(())
    }
}

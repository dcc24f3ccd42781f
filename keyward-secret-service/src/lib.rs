//! Client for the freedesktop Secret Service D-Bus API.
//!
//! Open a [`Session`] through [`SecretService`], then read and write secrets
//! through [`Collection`] and [`Item`] proxies. Operations that may need user
//! interaction return an [`Outcome`]; resolve its prompt with the service's
//! [`PromptController`].

pub mod bus;
pub mod collection;
pub mod crypto;
pub mod item;
pub mod prompt;
pub mod properties;
pub mod secret;
pub mod service;
pub mod session;
pub mod ss;

#[cfg(test)]
pub(crate) mod testing;

pub use bus::{Bus, Reply, SignalStream, ZbusBus};
pub use collection::{Collection, ItemEvent};
pub use item::Item;
pub use prompt::{Outcome, PromptController, PromptHandle, PromptResult};
pub use secret::Secret;
pub use service::{CollectionEvent, SearchResult, SecretService};
pub use session::Session;

//! HTTP client for the local browser window farm, implementing the
//! [`shelfwatch_core::ResourceProvider`] trait over its JSON API.

pub mod provider;

pub use provider::{HttpWindowProvider, WindowFarmConfig};

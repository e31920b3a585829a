//! Real-time canvas synchronization client.
//!
//! One reconnecting [`Connection`] per canvas feeds an [`EventBus`];
//! [`SectionSync`] keeps editable sections consistent across local input,
//! remote broadcasts and throttled autosave; [`history`] renders the audit
//! trail and dispatches view/revert.

pub mod api;
pub mod backoff;
pub mod bus;
pub mod caret;
pub mod config;
pub mod connection;
pub mod history;
pub mod surface;
pub mod sync;
pub mod throttle;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiError, CanvasApi, HistoryEntry, RestClient, Section};
pub use bus::{Callback, EventBus};
pub use config::{ClientConfig, ConnectionConfig, Origin, SyncConfig};
pub use connection::{Connection, ConnectionError, ConnectionStatus};
pub use surface::{EditorSurface, MemorySurface};
pub use sync::SectionSync;
pub use transport::{Connector, WsConnector};

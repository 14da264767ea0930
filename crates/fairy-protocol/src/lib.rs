//! Client for the Chromium DevTools debugging protocol.
//!
//! One duplex WebSocket channel per browser: outgoing method calls are
//! serialized with unique integer ids and matched to replies; unsolicited
//! events fan out to subscribers filtered by the session tag the browser
//! annotates them with.

mod client;
mod discovery;
mod error;
mod events;

pub use client::CdpClient;
pub use discovery::resolve_websocket_url;
pub use error::{CallError, ConnectError};
pub use events::{EventPayload, EventStream, SessionFilter};

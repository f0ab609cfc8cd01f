//! # hap-server
//!
//! The network side of a HAP accessory.
//!
//! This crate provides:
//! - Per-connection sessions and the registry that guards them
//! - Transparent ChaCha20-Poly1305 framing once pair-verify succeeds
//! - A minimal HTTP/1.1 reader and writer, including `EVENT/1.0` messages
//! - Routing for the pairing, accessory and characteristic endpoints
//! - Event fan-out to subscribed controllers
//! - The TCP accept loop

mod accessories;
mod events;
pub mod http;
mod router;
mod server;
mod session;
mod transport;

pub use accessories::{AccessoryDatabase, HapStatus, MemoryAccessories};
pub use events::{event_message, EventBroadcaster};
pub use http::{HttpRequest, HttpResponse, Method};
pub use router::{Routed, Router};
pub use server::Server;
pub use session::{ConnectionHandle, Outbound, Session, SessionRegistry};
pub use transport::{transport_error, SecureReader, SecureWriter};

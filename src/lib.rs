// #![warn(missing_docs)]

//! Rust implementation of the EPICS PV Access protocol, client and server.
//!
//! This crate is a pure-rust implementation of [PV Access]. It does not depend on
//! the C++ based [epics-base] project at all.
//!
//! <div class="warning">This is an early version of this library. Interfaces or
//! structure may be changed around between versions until a comfortable final
//! design is settled upon.</div>
//!
//! PV Access moves structured values ("normative types" and arbitrary nested
//! structures) between servers that publish named process variables and clients
//! that read, write, call and subscribe to them. This crate separates:
//!
//! - The typed value model and its wire encoding, in module [pvdata].
//! - Field requests (`field(value,alarm)`), which select part of a structure, in
//!   module [request].
//! - Mapping and serialization/deserialization of message types, in module
//!   [messages], and framing on TCP streams in [transport].
//! - A [Client] that searches for channels, shares one connection per server
//!   between them, reconnects after loss, and runs get/put/RPC/monitor operations.
//! - A [Server] that answers searches, accepts connections and serves the PVs you
//!   create on it, with subscriptions that follow [`ServerPV::update`].
//!
//! ## Example
//!
//! Serve a value and read it back:
//!
//! ```no_run
//! use pvars::{ClientBuilder, ServerBuilder, pvdata::{PvStructure, Structure}};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ServerBuilder::new().start().await?;
//!     let value = Structure::new().with("value", 3.13).with("tag", "Hello!");
//!     let pv = server.create_pv("DEMO", PvStructure::from_value(value)?)?;
//!
//!     let client = ClientBuilder::new().start().await?;
//!     let channel = client.channel("DEMO");
//!     let mut subscription = channel.subscribe("field(value)", Some(4)).await?;
//!     pv.update(Structure::new().with("value", 4.13).with("tag", "Hello!"))?;
//!     while let Some(update) = subscription.next_update().await {
//!         println!("{:?} changed: {:?}", update.value, update.changed_paths());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Current Status of crate
//!
//! What is currently present:
//! - UDP and name-server searching with backoff, beacons, and server lists.
//! - Get, put, RPC, monitor (with pipelining flow control) and type queries.
//! - Serving PVs with write and RPC handlers, search handlers and authorization.
//!
//! What this doesn't do (yet):
//! - Segmented messages, big-endian peers, or TLS.
//! - Authentication beyond the trusting `ca` and `anonymous` methods.
//!
//! [PV Access]: https://docs.epics-controls.org/en/latest/pv-access/protocol.html
//! [epics-base]: https://github.com/epics-base/epics-base

pub mod client;
pub mod messages;
pub mod pvdata;
pub mod request;
pub mod server;
pub mod transport;

mod utils;

pub use crate::client::{Channel, ChannelState, Client, ClientBuilder, ClientError};
pub use crate::server::{Server, ServerBuilder, ServerPV};
pub use crate::utils::Backoff;

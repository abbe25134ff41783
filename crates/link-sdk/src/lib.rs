//! `dslink-sdk`: client SDK for building DSA links.
//!
//! A "link" is any process that connects to a DSA broker over WebSocket.
//! As a **responder** it exposes a tree of nodes (values, metadata and
//! actions) that other links can list, subscribe to, set and invoke.  As a
//! **requester** it does the same to nodes exposed by other links.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Your Link                                                │
//! │                                                           │
//! │   let link = LinkBuilder::new("weather")                  │
//! │       .broker_url("http://broker:8080/conn")              │
//! │       .build().await?;                                    │
//! │   link.initialize().await;                                │
//! │   link.responder()?.root()                                │
//! │       .create_child("temp")?                              │
//! │       .value(21.5)                                        │
//! │       .build()?;                                          │
//! │   link.run(shutdown).await;                               │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection flow (hard-coded by the SDK)
//!
//! 1. Load or generate the P-256 key pair (`dslink.keys`)
//! 2. POST the handshake to the broker URL, receive the broker descriptor
//! 3. Derive `auth` from the broker's temp key and salt
//! 4. Open the WebSocket at `wsUri` in the negotiated format
//! 5. Main loop:
//!    - Acknowledge every inbound `msg`
//!    - `requests` go to the [`Responder`], `responses` to the [`Requester`]
//!    - Emit an empty envelope every heartbeat interval
//! 6. On disconnect: drop subscriptions and streams, reconnect with
//!    linear capped back-off

pub mod builder;
pub mod config;
pub mod connection;
pub mod handshake;
pub mod keypair;
pub mod link;
pub mod node;
pub mod observer;
pub mod platform;
pub mod reconnect;
pub mod requester;
pub mod responder;
pub mod types;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use builder::LinkBuilder;
pub use config::Configuration;
pub use connection::{Connection, ConnectionState};
pub use keypair::{KeyPair, P256KeyPair};
pub use link::{Link, LinkHandler};
pub use node::{
    ActionHandler, InvokeRequest, MetadataMap, Node, NodeBuilder, NodeValue, NodeView, ResultType,
};
pub use observer::ListenerId;
pub use platform::{FsStorage, Platform, Storage};
pub use reconnect::ReconnectBackoff;
pub use requester::{InvokeStream, InvokeUpdate, ListStream, RemoteNode, Requester, ResponseHandle};
pub use responder::Responder;
pub use types::{ActionError, LinkError, Result};

// Re-export protocol types so links never need to import dslink-protocol directly.
pub use dslink_protocol::{Column, Format, Permission, SubscriptionUpdate, Value};

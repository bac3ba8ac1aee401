//! Client-side request multiplexer for the Tessella distributed key-value
//! store.
//!
//! Tessella organizes data into named **spaces**; each space has an ordered
//! list of named dimensions where dimension 0 is the key. Data is sharded
//! across server **instances** according to hashes over the key and value
//! dimensions, and the mapping from `(space, key)` to the responsible
//! **entity** and instance is published by a coordinator, which may revise
//! it at any time.
//!
//! This crate is the client core: it caches the coordinator's configuration,
//! routes each operation to its point leader, multiplexes in-flight requests
//! over a per-instance channel pool, frames and correlates wire traffic, and
//! surfaces reconfiguration, disconnects, and timeouts to each waiting
//! operation.
//!
//! # Example
//!
//! ```rust,no_run
//! use tessella::{
//!     Client, Configuration, EntityId, Instance, ReturnCode, SpaceLayout, StaticCoordinator,
//! };
//!
//! let entity = EntityId::new(1, 0, 1);
//! let config = Configuration::builder()
//!     .version(1)
//!     .space(
//!         "users",
//!         SpaceLayout {
//!             id: 1,
//!             dimensions: vec!["id".into(), "name".into(), "email".into()],
//!             point_leaders: vec![entity],
//!             subspaces: vec![vec![entity]],
//!         },
//!     )
//!     .instance(entity, Instance::new("127.0.0.1:7878".parse().unwrap(), 1))
//!     .build();
//!
//! let mut client = Client::new(Box::new(StaticCoordinator::new(config)));
//! assert_eq!(client.connect(), ReturnCode::Success);
//!
//! client.get("users", "42", |code, value| {
//!     println!("get -> {code}: {value:?}");
//! });
//! client.flush(Some(std::time::Duration::from_secs(1)));
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ Client                                        │
//! │   get / put / del / update / search           │
//! └───────────────────────────────────────────────┘
//!        │ dispatch                 │ flush
//!        ▼                          ▼
//! ┌──────────────┐   ┌──────────────────────────┐
//! │ Configuration │  │ Event pump               │
//! │ space → ids   │  │  poll(channels + coord)  │
//! │ key → leader  │  │  match nonce → callback  │
//! └──────────────┘   └──────────────────────────┘
//!        │                          │
//!        ▼                          ▼
//! ┌──────────────┐   ┌──────────────────────────┐
//! │ ChannelTable  │  │ Pending queue            │
//! │ instance→TCP  │  │ get / mutate / search    │
//! └──────────────┘   └──────────────────────────┘
//! ```
//!
//! # Concurrency model
//!
//! Single-threaded and cooperative: the caller's thread drives one event
//! pump, there are no background threads and no locks. Dispatch entry points
//! never block on the network beyond the initial TCP connect and the request
//! write; responses are only read inside [`Client::flush`] /
//! [`Client::flush_one`]. The client retries nothing: every terminal
//! condition reaches the operation's callback exactly once, and the caller
//! decides which codes ([`ReturnCode::is_transient`]) are worth retrying.

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod search;
pub mod testing;
pub mod types;
pub mod wire;

mod channel;
mod pending;

pub use client::{Client, Row};
pub use config::{Configuration, ConfigurationBuilder, SpaceLayout};
pub use coordinator::{CoordinatorLink, LinkStatus, StaticCoordinator};
pub use error::{ReturnCode, WireError};
pub use search::SearchPredicate;
pub use types::{
    EntityId, Instance, NetMsgType, NetReturnCode, SpaceId, CLIENTSPACE, NULLSPACE,
};

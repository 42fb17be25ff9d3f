//! Sans-io mainline DHT (BEP-5).
//!
//! [`Dht`] owns the routing table, outstanding transactions and iterative
//! lookup tasks. It performs no I/O: the driver feeds it datagrams through
//! [`Dht::receive`], pumps time through [`Dht::tick`] and drains
//! [`Event`]s — `Transmit`/`Reply` events carry datagrams to put on the
//! wire, the rest report task completion.

mod bucket;
mod cache;
mod contact;
mod id;
mod msg;
mod server;
mod store;
mod table;
mod token;

pub use cache::NodeCache;
pub use contact::{Contact, Liveness};
pub use id::NodeId;
pub use msg::TxnId;
pub use server::{ClientRequest, Dht, Event, TaskId};
pub use table::RoutingTable;
pub use token::TokenStore;

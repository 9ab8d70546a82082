//! Local publish/subscribe bus shared by all astoria daemons
//!
//! # Topics
//!
//! ```text
//! {prefix}/{daemon}                          retained status document
//! {prefix}/{daemon}/request/{name}           request
//! {prefix}/{daemon}/request/{name}/{uuid}    correlated response
//! {prefix}/broadcast/{event}                 broadcast event
//! ```
//!
//! The broker either runs in-process ([`LocalTransport`]) or as the `astoria broker`
//! daemon reached over a unix socket ([`SocketTransport`]).

pub mod broadcast;
pub mod broker;
pub mod frame;
pub mod server;
pub mod topic;
pub mod transport;
pub mod wrapper;

pub use broadcast::BroadcastHelper;
pub use broker::Broker;
pub use server::BrokerServer;
pub use topic::{Topic, TopicError};
pub use transport::{LocalTransport, SocketTransport, Transport};
pub use wrapper::{handler, BusConfig, Handler, MessageBus};

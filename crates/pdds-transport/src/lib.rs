// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 pdds contributors

//! # pdds-transport
//!
//! Pluggable transport layer for the pdds publish/subscribe bus: transport
//! type registration, per-instance configuration, reference-counted data
//! links, association acknowledgment tracking, and deferred link teardown.
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        TransportFactory                             |
//! |  type registry ("udp", "tcp", ...)   instance registry ("net0")    |
//! +------------------------------+-------------------------------------+
//!                                |
//!                                v
//! +--------------------------------------------------------------------+
//! |                       TransportInstance                             |
//! |  +----------------+  +------------------+  +--------------------+  |
//! |  | Transport      |  | reservation table|  | AssociationTable   |  |
//! |  | (plugin trait) |  | key -> DataLink  |  | pending / acked    |  |
//! |  +-------+--------+  +---------+--------+  +--------------------+  |
//! |          |                     |                                   |
//! |          v                     v                                   |
//! |   ReactorTask (lazy)     DataLink (send/receive strategies)        |
//! +------------------------------+-------------------------------------+
//!                                |
//!                                v
//!                     DataLinkCleanupTask (shared worker)
//! ```
//!
//! The upper layers talk to the [`TransportFactory`] and the
//! [`TransportInstance`]s it creates; concrete transports implement the
//! [`Transport`] trait plus a [`SendStrategy`]/[`ReceiveStrategy`] pair per
//! link. Association requests arriving from discovery are turned into
//! reference-counted [`DataLink`]s keyed by [`ConnectionKey`], and reliable
//! plugins confirm setup through the ack envelope in [`association`].

pub mod association;
pub mod cleanup;
pub mod config;
pub mod datalink;
pub mod error;
pub mod factory;
pub mod instance;
pub mod key;
pub mod reactor;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use association::{demarshal_acks, marshal_acks, AssociationTable};
pub use cleanup::{CleanupHandle, DataLinkCleanupTask};
pub use config::{downcast_config, CommonConfig, TransportConfig};
pub use datalink::{
    DataLink, LinkState, OpenOutcome, ReceiveStrategy, SendOutcome, SendStrategy,
};
pub use error::{Result, TransportError};
pub use factory::{TransportFactory, TransportGenerator};
pub use instance::{Transport, TransportInstance};
pub use key::ConnectionKey;
pub use reactor::{EventHandler, ReactorHandle, ReactorTask};
pub use types::{
    AssociationInfo, ConnectionInfo, Direction, LinkQos, ReaderHandle, ReliabilityKind, RepoId,
    WriterHandle,
};

/// Crate version, for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

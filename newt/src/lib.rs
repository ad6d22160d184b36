//! `newt` is a lightweight OMA LwM2M client core in Rust that aims to be:
//! - Allocation-free (every table is fixed-capacity, sized at compile time)
//! - Platform-independent (network and clock arrive as traits)
//! - Cooperative (one non-blocking [`client::Client::step`] drives
//!   everything)
//!
//! ## LwM2M
//! LwM2M is a device-management protocol for constrained devices, layered
//! on CoAP/UDP. A client registers with a management server, exposes a
//! tree of objects/instances/resources, answers the server's reads and
//! writes, pushes observation notifications, and can be re-provisioned by
//! a bootstrap server.
//!
//! This crate is the protocol engine only: the connection life cycle
//! (bootstrap → register → registered/queue mode → deregister), the
//! CoAP exchange machinery (retransmission, duplicate suppression,
//! block-wise transfer), the observation scheduler, and the transactional
//! data-model dispatcher. The concrete objects (Security, Server,
//! Device, ...), the socket, the clock, and the multi-entry payload
//! codecs are host-supplied collaborators behind the traits in [`net`],
//! [`time`], [`dm`], and [`codec`].
//!
//! ## Driving it
//! ```ignore
//! let mut client = Client::new(Config::default(), server_cfg, sock, clock);
//! loop {
//!   let mut objs: [&mut dyn Object; 2] = [&mut server_obj, &mut device_obj];
//!   let mut dm = Registry::new(&mut objs);
//!   client.step(&mut dm, &mut app)?;
//!   sleep_until(client.next_step_time());
//! }
//! ```

// x-release-please-start-version
#![doc(html_root_url = "https://docs.rs/newt/0.6.0")]
// x-release-please-end
#![cfg_attr(not(feature = "std"), no_std)]
// style
#![allow(clippy::unused_unit)]
// deny
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(not(test), deny(unsafe_code))]
// warnings
#![cfg_attr(not(test), warn(unreachable_pub))]
#![cfg_attr(any(docsrs, feature = "docs"), feature(doc_cfg))]

#[cfg(test)]
pub(crate) mod test;

pub(crate) mod logging;
pub(crate) mod writable;

/// the engine and its host-facing traits
pub mod client;

/// runtime configuration & compile-time capacities
pub mod config;

/// pluggable payload codec seam
pub mod codec;

/// the transactional data model
pub mod dm;

/// tagged error taxonomy
pub mod error;

/// one in-flight CoAP exchange
pub mod exchange;

/// duplicate suppression for server requests
pub mod cache;

/// CoRE-Link payload writers
pub mod link;

/// network adapter traits
pub mod net;

/// observations & notification attributes
pub mod observe;

/// LwM2M paths
pub mod path;

/// persistence stream contracts
pub mod persist;

/// registration session bookkeeping
pub mod reg;

/// bootstrap driver
pub mod bootstrap;

/// non-blocking retry & back-off timers
pub mod retry;

/// the outbound Send queue
pub mod send;

/// time abstractions
pub mod time;

/// `std`-only newt stuff
#[cfg(feature = "std")]
#[cfg_attr(docsrs, doc(cfg(feature = "std")))]
pub mod std;

pub use client::{App, Client, ServerConfig};
pub use config::Config;
pub use error::Error;
pub use path::Path;

// SPDX-License-Identifier: AGPL-3.0-or-later
//! BitBurrow: turn a consumer router into a VPN gateway
//!
//! The library finds a router on the local network (joining its WiFi when
//! needed), takes it over from factory state, and brings it to the current
//! versions of its configuration coteries.
//!
//! # Features
//!
//! * **Discovery:** factory SSID patterns, subnet guesses, host-key identity
//! * **Bootstrap:** SSH with no authentication or telnet, then key install
//! * **Coteries:** versioned, sorted configuration units run at most once per version

pub mod bootstrap;
pub mod config;
pub mod coterie;
pub mod credentials;
pub mod document;
pub mod error;
pub mod local;
pub mod network;
pub mod provision;
pub mod registry;
pub mod remote;
pub mod selfcheck;
pub mod store;
pub mod wifi;

pub use config::{Config, Router};
pub use error::{BurrowError, Result};

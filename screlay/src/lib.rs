//! An *LE Secure Connections* pairing engine and a dual-link BLE relay built on it.
//!
//! Tries to adhere to the Security Manager chapter of the *Bluetooth Core Specification v5.x*
//! (Vol 3, Part H).
//!
//! # Overview
//!
//! The crate has two layers:
//!
//! * [`security`] implements pairing itself: the `f4`/`f5`/`f6`/`g2` toolbox, a per-attempt
//!   [`CryptoSession`], and a sans-IO [`PairingStateMachine`] that consumes Security Manager
//!   commands and returns the [`Action`]s to carry out. It can also learn a passkey from a peer by
//!   reflecting its commitments.
//! * [`relay`] connects two such machines back to back. A [`Relay`] clones a peripheral's
//!   advertising data, lets a real central connect to it, pairs with both sides independently,
//!   and only then forwards traffic between them.
//!
//! Radio access is not part of this crate. Both links are driven through the [`Link`] trait, and
//! link activity is fed back in as [`LinkEvent`]s.
//!
//! [`security`]: security/index.html
//! [`CryptoSession`]: security/struct.CryptoSession.html
//! [`PairingStateMachine`]: security/struct.PairingStateMachine.html
//! [`Action`]: security/enum.Action.html
//! [`relay`]: relay/index.html
//! [`Relay`]: relay/struct.Relay.html
//! [`Link`]: link/trait.Link.html
//! [`LinkEvent`]: link/enum.LinkEvent.html

// Deny a few warnings in doctests, since rustdoc `allow`s many warnings by default
#![doc(test(attr(deny(unused_imports, unused_must_use))))]
#![warn(rust_2018_idioms)]
// The claims of this lint are dubious, disable it
#![allow(clippy::trivially_copy_pass_by_ref)]

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod bytes;
pub mod config;
pub mod ecdh;
mod error;
pub mod l2cap;
pub mod link;
pub mod relay;
pub mod security;

pub use self::error::Error;

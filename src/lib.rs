//! Single-device Spotify remote built on a hand-rolled HTTP/1.1 client.
//!
//! The crate is organized leaves-first:
//! * [`transport`] and [`response`] form the raw protocol engine: one fresh
//!   TLS connection per exchange, and an incremental response parser.
//! * [`token`] owns the OAuth2 credential lifecycle.
//! * [`player`] speaks the player-control API surface.
//! * [`scheduler`] sequences everything from a single cooperative tick loop.
//!
//! External collaborators (input devices, the browser callback surface, a
//! display) connect through three narrow seams: [`scheduler::ActionHandle`]
//! to post actions, [`events::EventSink`] for diagnostics, and
//! [`scheduler::Presenter`] for playback updates.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod config;
pub mod events;
pub mod exchange;
pub mod player;
pub mod response;
pub mod scheduler;
pub mod store;
pub mod token;
pub mod transport;

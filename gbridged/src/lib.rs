//! Greybus bridge daemon.
//!
//! `gbridged` speaks the Greybus SVC protocol to the host kernel over a
//! generic netlink socket and attaches remote Greybus modules reached over
//! serial, TCP/IP or Bluetooth RFCOMM, or a simulated module described by
//! a manifest file. The pieces: the protocol engine ([`engine`]), the
//! per-protocol drivers ([`svc`], [`control`], [`loopback`]), the routing
//! fabric ([`bridge`], [`controller`]) and the transports ([`netlink`],
//! [`controllers`]).

pub mod bridge;
pub mod control;
pub mod controller;
pub mod controllers;
pub mod driver;
pub mod engine;
pub mod logging;
pub mod loopback;
pub mod netlink;
pub mod svc;

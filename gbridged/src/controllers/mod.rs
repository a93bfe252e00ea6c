//! The transport controller implementations.

pub mod gbsim;
pub mod tcpip;
pub mod uart;

#[cfg(feature = "bluetooth")]
pub mod bluetooth;

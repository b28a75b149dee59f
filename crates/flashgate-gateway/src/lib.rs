//! Flash-programmer gateway.
//!
//! Accepts one peer at a time per pipe, runs the flashgate protocol stack
//! over it, and serves the programmer's application surface: board and
//! firmware catalogs with favourites, chunked firmware upload, flashing via
//! an external programmer, and a debugger bridge streaming console lines
//! both ways.

pub mod catalog;
pub mod debugger;
pub mod flash;
pub mod gateway;
pub mod upload;

pub use gateway::{Gateway, GatewayConfig};

//! # Transport Layer
//!
//! TCP socket ownership and the event loop.
//!
//! ## Components
//! - **Reactor**: dedicated I/O thread, accept/dial, read/write, shutdown
//! - **Ban list**: regex patterns checked against remote addresses on accept

pub mod ban_list;
pub mod reactor;

pub use ban_list::BanList;
pub use reactor::{Reactor, ReactorHandle};

//! Network address types
//!
//! This module provides the [`Addr`] endpoint type used throughout the
//! tunnel: in configuration, in stream preambles, and in server-side dialing.

mod addr;

pub use addr::{Addr, Host, ATYP_DOMAIN, ATYP_V4, ATYP_V6};

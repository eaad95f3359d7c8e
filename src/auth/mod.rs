//! Client authentication.
//!
//! Git clients authenticate with HTTP Basic.  The user name is ignored; the
//! password must equal the cluster's shared secret, compared in constant
//! time.

pub mod basic;
pub mod secret;

pub use basic::parse_basic_auth;
pub use secret::SharedSecret;

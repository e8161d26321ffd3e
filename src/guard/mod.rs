//! Protections consulted before rate-limit accounting.
//!
//! The access lists run first for every request; abuse tracking runs for
//! IP-partitioned policies.

mod access;
mod ddos;

pub use access::IpAccessList;
pub use ddos::DdosGuard;

//! Port-forwarding tunnels relayed through beacon check-ins.
//!
//! The server never touches the target socket. It keeps per-tunnel queues in
//! [`TunnelRegistry`]: operator data waits in the outbound queue until the
//! owning beacon polls, and beacon data waits in the inbound queue until the
//! operator pulls it. The beacon crate owns the socket side.

pub mod registry;

pub use registry::{TunnelError, TunnelInfo, TunnelRegistry, TunnelStatus};

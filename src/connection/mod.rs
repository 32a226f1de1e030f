//! Connection lifecycle: dial, TLS, HELLO/SASL/SelectBucket bring-up, and the
//! bounded per-node pool operations borrow connections from (§4.3).

pub mod handshake;
pub mod pool;
pub mod sasl;
pub mod tls;

pub use pool::{Connection, ConnectionPool, NodeAuth, PooledCheckout};
pub use tls::DataStream;

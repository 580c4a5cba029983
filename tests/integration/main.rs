//! End-to-end tests over in-memory stores.
//!
//! Each module drives the public engine API the way the binary wires it,
//! with the network collaborators replaced by `mock_executor`.

mod mock_executor;
mod order_execution;
mod reconciler_idempotency;
mod settlement_flow;

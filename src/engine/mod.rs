//! Core engine: intake, the settlement aggregator, the portfolio
//! reconciler and the order engine.

pub mod aggregator;
pub mod guard;
pub mod intake;
pub mod orders;
pub mod reconciler;

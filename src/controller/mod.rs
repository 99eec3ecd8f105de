//! Controller implementations for Trellis CRDs
//!
//! This module contains the reconciliation logic invoked by the dispatcher.
//! The lifecycle handler inspects cluster state for each NodeContribution
//! event and routes it to a setup or recovery procedure.

mod contribution;

pub use contribution::LifecycleHandler;

//! `InteractiveSession` reconciliation.

pub mod children;
pub mod cleanup;
pub mod client;
pub mod controller;
pub mod culling;
pub mod diagnosis;
pub mod idle;
pub mod manifests;
pub mod naming;
pub mod status;

pub use controller::{apply_session, reconcile_session};

//! Reconciliation of `Ray` clusters
//!
//! Each pass composes the desired head Deployment, worker Deployment and
//! head Service, applies them with narrow change detection, and folds the
//! live Deployment and pod state back into the Ray's status conditions.

#![deny(missing_docs)]

pub mod apply;
pub mod client;
pub mod composer;
pub mod controller;
pub mod semantic;
pub mod status;
pub mod validator;

#[cfg(test)]
mod testing;

pub use client::{RayKubeClient, RayKubeClientImpl};
pub use composer::{Composer, DefaultComposer};
pub use controller::{error_policy, reconcile, Context, CONTROLLER_NAME};
pub use validator::{NoopValidator, Validator};

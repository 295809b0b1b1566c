//! Admission policy for Ray specs
//!
//! A rejected Ray is not reconciled and not requeued until its spec changes.

#[cfg(test)]
use mockall::automock;

use ray_common::crd::Ray;
use ray_common::Error;

/// Decides whether a Ray may be reconciled
#[cfg_attr(test, automock)]
pub trait Validator: Send + Sync {
    /// Return `Err(Error::Validation { .. })` to reject the Ray
    fn validate_ray(&self, ray: &Ray) -> Result<(), Error>;
}

/// Accepts every Ray
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopValidator;

impl Validator for NoopValidator {
    fn validate_ray(&self, _ray: &Ray) -> Result<(), Error> {
        Ok(())
    }
}

//! Backend abstraction for provisioning disposable compute instances.
//!
//! A backend translates the three lifecycle calls below into one
//! provider's native API. Everything above this layer (machines, clusters,
//! the test runner) is written against the trait only.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use thiserror::Error;

/// Parameters required to create a new instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceRequest {
    /// Name given to the instance at the provider.
    pub name: String,
    /// Opaque boot configuration (for example a cloud-init document)
    /// passed verbatim to the provider.
    pub boot_config: Option<String>,
}

impl InstanceRequest {
    /// Starts a builder for an [`InstanceRequest`].
    #[must_use]
    pub fn builder() -> InstanceRequestBuilder {
        InstanceRequestBuilder::new()
    }

    /// Validates the request, returning a descriptive error when a required
    /// field is missing.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when the name is empty.
    pub fn validate(&self) -> Result<(), BackendError> {
        if self.name.is_empty() {
            return Err(BackendError::Validation("name".to_owned()));
        }
        Ok(())
    }
}

/// Builder for [`InstanceRequest`] that defers trimming and validation to
/// construction.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceRequestBuilder {
    name: String,
    boot_config: Option<String>,
}

impl InstanceRequestBuilder {
    /// Creates an empty builder; the name must be set before build.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the instance name.
    #[must_use]
    pub fn name(mut self, value: impl Into<String>) -> Self {
        self.name = value.into();
        self
    }

    /// Sets the boot configuration. Blank payloads are treated as absent.
    #[must_use]
    pub fn boot_config(mut self, value: impl Into<String>) -> Self {
        let payload = value.into();
        self.boot_config = (!payload.trim().is_empty()).then_some(payload);
        self
    }

    /// Builds and validates the [`InstanceRequest`]. The name is trimmed; the
    /// boot configuration is passed through untouched.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when the name is empty.
    pub fn build(self) -> Result<InstanceRequest, BackendError> {
        let request = InstanceRequest {
            name: self.name.trim().to_owned(),
            boot_config: self.boot_config,
        };
        request.validate()?;
        Ok(request)
    }
}

/// Handle returned by a backend once an instance has been created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceHandle {
    /// Provider specific identifier for the instance.
    pub id: String,
    /// Zone in which the instance was created.
    pub zone: String,
}

/// Connection details for reaching an instance once it is ready.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstanceNetworking {
    /// Public address assigned by the provider.
    pub public_ip: IpAddr,
    /// Address on the provider's private network, when there is one.
    pub private_ip: Option<IpAddr>,
}

/// Errors raised by backends.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is missing a required field.
    #[error("missing or empty field: {0}")]
    Validation(String),
}

/// Future returned by backend operations.
pub type BackendFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Minimal interface implemented by cloud backends.
pub trait Backend: Send + Sync + 'static {
    /// Provider specific error type returned by the backend.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates a new instance and returns a handle used for subsequent calls.
    fn create<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> BackendFuture<'a, InstanceHandle, Self::Error>;

    /// Waits until the provider reports the instance running with an address
    /// and returns its networking info.
    fn wait_for_ready<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, InstanceNetworking, Self::Error>;

    /// Destroys the instance and ensures no provider resources remain.
    fn destroy(&self, handle: InstanceHandle) -> BackendFuture<'_, (), Self::Error>;
}

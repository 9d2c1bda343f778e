//! In-memory backend for exercising clusters and the runner without a cloud.
//!
//! [`FakeBackend`] keeps its instances behind a shared lock, so clones hand
//! out views of one simulated provider. Failures can be injected for the
//! next N calls of each lifecycle operation.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;

use crate::backend::{
    Backend, BackendError, BackendFuture, InstanceHandle, InstanceNetworking, InstanceRequest,
};

/// Platform identifier under which the fake backend is registered.
pub const PLATFORM: &str = "fake";

const ZONE: &str = "fake-1";
const PUBLIC_BASE: Ipv4Addr = Ipv4Addr::new(198, 18, 0, 0);
const PRIVATE_BASE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 0);

/// Instance held by the fake provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FakeInstance {
    /// Provider identifier.
    pub id: String,
    /// Name from the creation request.
    pub name: String,
    /// Boot configuration passed at creation.
    pub boot_config: Option<String>,
    /// Assigned public address.
    pub public_ip: IpAddr,
    /// Assigned private address.
    pub private_ip: IpAddr,
}

#[derive(Debug, Default)]
struct FakeState {
    serial: u32,
    instances: BTreeMap<String, FakeInstance>,
    failing_creates: u32,
    failing_readies: u32,
    failing_destroys: u32,
    destroyed: u32,
    create_latency: Duration,
}

/// Errors raised by the fake backend.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FakeBackendError {
    /// Raised when the request fails validation.
    #[error("invalid instance request: {0}")]
    Validation(String),
    /// Raised by an injected creation failure.
    #[error("creation of {name} rejected")]
    CreateRejected {
        /// Requested instance name.
        name: String,
    },
    /// Raised by an injected readiness failure.
    #[error("instance {id} never became ready")]
    NotReady {
        /// Provider identifier.
        id: String,
    },
    /// Raised by an injected teardown failure. The instance is kept.
    #[error("failed to destroy instance {id}")]
    DestroyFailed {
        /// Provider identifier.
        id: String,
    },
    /// Raised when the instance does not exist.
    #[error("instance {id} not found")]
    NotFound {
        /// Provider identifier.
        id: String,
    },
}

impl From<BackendError> for FakeBackendError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Validation(field) => Self::Validation(field),
        }
    }
}

/// Simulated provider whose resources live in memory.
#[derive(Clone, Debug, Default)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    /// Creates a provider with no instances.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instances that currently exist at the provider.
    #[must_use]
    pub fn live_instances(&self) -> usize {
        self.lock().instances.len()
    }

    /// Snapshot of the instances that currently exist, ordered by identifier.
    #[must_use]
    pub fn instances(&self) -> Vec<FakeInstance> {
        self.lock().instances.values().cloned().collect()
    }

    /// Total number of instances ever created.
    #[must_use]
    pub fn created(&self) -> u32 {
        self.lock().serial
    }

    /// Total number of successful teardowns.
    #[must_use]
    pub fn destroyed(&self) -> u32 {
        self.lock().destroyed
    }

    /// Makes the next `count` creation requests fail.
    pub fn fail_next_creates(&self, count: u32) {
        self.lock().failing_creates = count;
    }

    /// Makes the next `count` readiness waits fail.
    pub fn fail_next_readies(&self, count: u32) {
        self.lock().failing_readies = count;
    }

    /// Makes the next `count` teardowns fail, leaving the instances behind.
    pub fn fail_next_destroys(&self, count: u32) {
        self.lock().failing_destroys = count;
    }

    /// Makes every creation request take `latency` after the instance
    /// already exists at the provider, like a slow API acknowledgement.
    pub fn delay_creates(&self, latency: Duration) {
        self.lock().create_latency = latency;
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_now(&self, request: &InstanceRequest) -> Result<InstanceHandle, FakeBackendError> {
        request.validate()?;
        let mut state = self.lock();
        if take_failure(&mut state.failing_creates) {
            return Err(FakeBackendError::CreateRejected {
                name: request.name.clone(),
            });
        }

        state.serial += 1;
        let serial = state.serial;
        let id = format!("fake-{serial}");
        state.instances.insert(
            id.clone(),
            FakeInstance {
                id: id.clone(),
                name: request.name.clone(),
                boot_config: request.boot_config.clone(),
                public_ip: offset(PUBLIC_BASE, serial),
                private_ip: offset(PRIVATE_BASE, serial),
            },
        );
        Ok(InstanceHandle {
            id,
            zone: ZONE.to_owned(),
        })
    }

    fn ready_now(&self, handle: &InstanceHandle) -> Result<InstanceNetworking, FakeBackendError> {
        let mut state = self.lock();
        let Some(instance) = state.instances.get(&handle.id).cloned() else {
            return Err(FakeBackendError::NotFound {
                id: handle.id.clone(),
            });
        };
        if take_failure(&mut state.failing_readies) {
            return Err(FakeBackendError::NotReady {
                id: handle.id.clone(),
            });
        }
        Ok(InstanceNetworking {
            public_ip: instance.public_ip,
            private_ip: Some(instance.private_ip),
        })
    }

    fn destroy_now(&self, handle: &InstanceHandle) -> Result<(), FakeBackendError> {
        let mut state = self.lock();
        if !state.instances.contains_key(&handle.id) {
            return Err(FakeBackendError::NotFound {
                id: handle.id.clone(),
            });
        }
        if take_failure(&mut state.failing_destroys) {
            return Err(FakeBackendError::DestroyFailed {
                id: handle.id.clone(),
            });
        }
        state.instances.remove(&handle.id);
        state.destroyed += 1;
        Ok(())
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter == 0 {
        return false;
    }
    *counter -= 1;
    true
}

fn offset(base: Ipv4Addr, serial: u32) -> IpAddr {
    IpAddr::V4(Ipv4Addr::from(u32::from(base).saturating_add(serial)))
}

impl Backend for FakeBackend {
    type Error = FakeBackendError;

    fn create<'a>(
        &'a self,
        request: &'a InstanceRequest,
    ) -> BackendFuture<'a, InstanceHandle, Self::Error> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let created = self.create_now(request);
            let latency = self.lock().create_latency;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            created
        })
    }

    fn wait_for_ready<'a>(
        &'a self,
        handle: &'a InstanceHandle,
    ) -> BackendFuture<'a, InstanceNetworking, Self::Error> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.ready_now(handle)
        })
    }

    fn destroy(&self, handle: InstanceHandle) -> BackendFuture<'_, (), Self::Error> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.destroy_now(&handle)
        })
    }
}

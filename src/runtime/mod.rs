//! External capability traits (spec §1's "Out of scope" collaborators).
//!
//! The container runtime, egress/VPN health checker and audit database are
//! all explicitly out of scope for this crate, but the autoscaler and web
//! layer still need *something* to call. Rather than reach for a global or
//! leave a dangling TODO, each is expressed as a small trait the `App` is
//! constructed with; the crate ships a no-op default for each so it runs
//! standalone; a real deployment supplies its own implementation.

use async_trait::async_trait;

use crate::errors::FleetResult;
use crate::models::{AuditEvent, EgressState, EngineHandle};

/// Launches and tears down engine processes. Out of scope per spec §1 —
/// this crate only decides *how many* engines should exist
/// ([`crate::autoscaler::Autoscaler`]), never how they're launched.
#[async_trait]
pub trait EngineRuntime: Send + Sync {
    async fn launch(&self, count: u32) -> FleetResult<Vec<EngineHandle>>;
    async fn terminate(&self, container_id: &str) -> FleetResult<()>;
    async fn list_running(&self) -> FleetResult<Vec<EngineHandle>>;
}

/// Reports whether the egress path (VPN, proxy, whatever the deployment
/// uses) is currently usable. Out of scope per spec §1.
#[async_trait]
pub trait EgressHealth: Send + Sync {
    async fn status(&self) -> EgressState;
}

/// Accepts audit-only lifecycle records. Out of scope per spec §1: the
/// crate never reads these back, fleet state is always reconstructable
/// from the runtime's running containers plus the in-memory Registry.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Runtime that manages nothing; used when the crate is wired up without a
/// real container backend (tests, local development against pre-launched
/// engines).
pub struct NoopEngineRuntime;

#[async_trait]
impl EngineRuntime for NoopEngineRuntime {
    async fn launch(&self, _count: u32) -> FleetResult<Vec<EngineHandle>> {
        Ok(Vec::new())
    }

    async fn terminate(&self, _container_id: &str) -> FleetResult<()> {
        Ok(())
    }

    async fn list_running(&self) -> FleetResult<Vec<EngineHandle>> {
        Ok(Vec::new())
    }
}

/// Egress checker that always reports disabled, i.e. "not monitored".
pub struct NullEgressHealth;

#[async_trait]
impl EgressHealth for NullEgressHealth {
    async fn status(&self) -> EgressState {
        EgressState::Disabled
    }
}

/// Audit sink that writes to the tracing log instead of a database.
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        tracing::info!(
            kind = %event.kind,
            stream_id = ?event.stream_id,
            container_id = ?event.container_id,
            detail = %event.detail,
            "audit"
        );
    }
}

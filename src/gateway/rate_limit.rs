use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tracing::debug;

use crate::error::GatewayError;
use crate::models::GamingService;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token bucket for one integration (or one credential inside a pool).
///
/// Acquisition suspends until a cell is available; requests are never dropped.
#[derive(Clone)]
pub struct ServiceLimiter {
    service: GamingService,
    inner: Arc<DirectLimiter>,
}

impl ServiceLimiter {
    pub fn per_minute(service: GamingService, requests: u32) -> Self {
        let n = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        Self::with_quota(service, Quota::per_minute(n))
    }

    pub fn per_second(service: GamingService, requests: u32) -> Self {
        let n = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        Self::with_quota(service, Quota::per_second(n))
    }

    pub fn with_quota(service: GamingService, quota: Quota) -> Self {
        Self {
            service,
            inner: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn service(&self) -> GamingService {
        self.service
    }

    pub async fn acquire(&self) {
        self.inner.until_ready().await;
    }

    /// Take a cell only if one is free right now.
    pub fn try_acquire(&self) -> bool {
        self.inner.check().is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStrategy {
    RoundRobin,
    /// First member with a free cell; falls back to round-robin waiting when all are drained.
    FirstAvailable,
}

struct PoolMember<C> {
    client: C,
    limiter: ServiceLimiter,
}

/// Rotating set of credentialed clients, each with its own bucket.
pub struct ClientPool<C> {
    service: GamingService,
    members: Vec<PoolMember<C>>,
    strategy: PoolStrategy,
    cursor: AtomicUsize,
}

impl<C> ClientPool<C> {
    pub fn new(
        service: GamingService,
        members: Vec<(C, ServiceLimiter)>,
        strategy: PoolStrategy,
    ) -> Result<Self, GatewayError> {
        if members.is_empty() {
            return Err(GatewayError::NoClients { service });
        }
        Ok(Self {
            service,
            members: members
                .into_iter()
                .map(|(client, limiter)| PoolMember { client, limiter })
                .collect(),
            strategy,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Pick a member and wait on its bucket. The returned client may be used for one request.
    pub async fn acquire(&self) -> &C {
        if self.strategy == PoolStrategy::FirstAvailable {
            if let Some((idx, member)) = self
                .members
                .iter()
                .enumerate()
                .find(|(_, m)| m.limiter.try_acquire())
            {
                debug!(service = %self.service, member = idx, "pool member available");
                return &member.client;
            }
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.members.len();
        let member = &self.members[idx];
        member.limiter.acquire().await;
        debug!(service = %self.service, member = idx, "pool member acquired");
        &member.client
    }
}

//! Capacity admission control
//!
//! Global concurrency, per-tenant concurrency, and per-tenant per-minute
//! rate limiting over a shared Redis, decided by one server-side Lua script
//! so two racing admits can never both squeeze through the last slot. The
//! script is invoked through `redis::Script`, which caches the SHA and falls
//! back to a full EVAL on NOSCRIPT after a store restart.
//!
//! Key layout:
//! - `{cap}:global:active`            SET of admitted call-control-ids
//! - `{cap}:tenant:{tid}:active`      SET of admitted call-control-ids
//! - `{cap}:tenant:{tid}:rpm:{YYYYMMDDHHMM}`  counter, 120 s TTL
//! - `{map}:tenant:{tid}:cap:concurrency`     optional override
//! - `{map}:tenant:{tid}:cap:rpm`             optional override

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use crate::config::{CapacityConfig, TenantConfig};

const ACQUIRE_SCRIPT: &str = r#"
local id = ARGV[1]
local global_cap = tonumber(ARGV[2])
local tenant_cap = tonumber(ARGV[3])
local rpm_cap = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local cap_override = tonumber(redis.call('GET', KEYS[4]) or '')
if cap_override and cap_override > 0 then tenant_cap = cap_override end
local rpm_override = tonumber(redis.call('GET', KEYS[5]) or '')
if rpm_override and rpm_override > 0 then rpm_cap = rpm_override end

if redis.call('SISMEMBER', KEYS[1], id) == 1 or redis.call('SISMEMBER', KEYS[2], id) == 1 then
  redis.call('SADD', KEYS[1], id)
  redis.call('SADD', KEYS[2], id)
  redis.call('EXPIRE', KEYS[1], ttl)
  redis.call('EXPIRE', KEYS[2], ttl)
  return 'ok'
end

if redis.call('SCARD', KEYS[1]) >= global_cap then
  return 'global_at_capacity'
end
if redis.call('SCARD', KEYS[2]) >= tenant_cap then
  return 'tenant_at_capacity'
end
local rpm = tonumber(redis.call('GET', KEYS[3]) or '0')
if rpm >= rpm_cap then
  return 'tenant_rate_limited'
end

redis.call('SADD', KEYS[1], id)
redis.call('SADD', KEYS[2], id)
redis.call('EXPIRE', KEYS[1], ttl)
redis.call('EXPIRE', KEYS[2], ttl)
local bumped = redis.call('INCR', KEYS[3])
if bumped == 1 then
  redis.call('EXPIRE', KEYS[3], 120)
end
return 'ok'
"#;

/// Why an admission was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    GlobalAtCapacity,
    TenantAtCapacity,
    TenantRateLimited,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GlobalAtCapacity => "global_at_capacity",
            Self::TenantAtCapacity => "tenant_at_capacity",
            Self::TenantRateLimited => "tenant_rate_limited",
        }
    }
}

/// Outcome of `try_acquire`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Denied(DenyReason),
}

/// Atomic admission over the shared store
#[derive(Clone)]
pub struct CapacityService {
    conn: ConnectionManager,
    config: CapacityConfig,
}

impl CapacityService {
    pub async fn connect(config: CapacityConfig) -> Result<Self> {
        let client =
            redis::Client::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connecting to capacity store")?;
        Ok(Self { conn, config })
    }

    /// Key builders -------------------------------------------------------

    pub fn global_active_key(&self) -> String {
        format!("{}:global:active", self.config.cap_prefix)
    }

    pub fn tenant_active_key(&self, tenant_id: &str) -> String {
        format!("{}:tenant:{tenant_id}:active", self.config.cap_prefix)
    }

    pub fn tenant_rpm_key(&self, tenant_id: &str, now: DateTime<Utc>) -> String {
        format!(
            "{}:tenant:{tenant_id}:rpm:{}",
            self.config.cap_prefix,
            minute_bucket(now)
        )
    }

    fn concurrency_override_key(&self, tenant_id: &str) -> String {
        format!(
            "{}:tenant:{tenant_id}:cap:concurrency",
            self.config.tenantmap_prefix
        )
    }

    fn rpm_override_key(&self, tenant_id: &str) -> String {
        format!("{}:tenant:{tenant_id}:cap:rpm", self.config.tenantmap_prefix)
    }

    /// Atomically try to admit `call_control_id` for `tenant_id`.
    ///
    /// Idempotent: a second acquire for an already-admitted id refreshes
    /// TTLs and succeeds without touching the rpm counter.
    pub async fn try_acquire(
        &self,
        tenant_id: &str,
        call_control_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        let mut conn = self.conn.clone();
        let verdict: String = redis::Script::new(ACQUIRE_SCRIPT)
            .key(self.global_active_key())
            .key(self.tenant_active_key(tenant_id))
            .key(self.tenant_rpm_key(tenant_id, now))
            .key(self.concurrency_override_key(tenant_id))
            .key(self.rpm_override_key(tenant_id))
            .arg(call_control_id)
            .arg(self.config.global_concurrency_cap)
            .arg(self.config.tenant_concurrency_cap_default)
            .arg(self.config.tenant_calls_per_min_cap_default)
            .arg(self.config.capacity_ttl_seconds)
            .invoke_async(&mut conn)
            .await
            .context("capacity acquire script")?;

        let admission = match verdict.as_str() {
            "ok" => Admission::Admitted,
            "global_at_capacity" => Admission::Denied(DenyReason::GlobalAtCapacity),
            "tenant_at_capacity" => Admission::Denied(DenyReason::TenantAtCapacity),
            "tenant_rate_limited" => Admission::Denied(DenyReason::TenantRateLimited),
            other => anyhow::bail!("unexpected capacity verdict {other:?}"),
        };
        debug!(tenant_id, call_control_id, ?admission, "capacity admission");
        Ok(admission)
    }

    /// Remove the id from both active sets
    pub async fn release(&self, tenant_id: &str, call_control_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let (global, tenant): (u32, u32) = redis::pipe()
            .srem(self.global_active_key(), call_control_id)
            .srem(self.tenant_active_key(tenant_id), call_control_id)
            .query_async(&mut conn)
            .await
            .context("capacity release")?;
        info!(
            tenant_id,
            call_control_id,
            removed_global = global,
            removed_tenant = tenant,
            "capacity released"
        );
        Ok(())
    }
}

/// Tenant directory: DID → tenant id and tenant configuration JSON
#[derive(Clone)]
pub struct TenantDirectory {
    conn: ConnectionManager,
    config: CapacityConfig,
}

impl TenantDirectory {
    pub fn new(conn: ConnectionManager, config: CapacityConfig) -> Self {
        Self { conn, config }
    }

    pub async fn connect(config: CapacityConfig) -> Result<Self> {
        let client =
            redis::Client::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("connecting to tenant store")?;
        Ok(Self { conn, config })
    }

    pub fn did_key(&self, e164: &str) -> String {
        format!("{}:did:{e164}", self.config.tenantmap_prefix)
    }

    pub fn tenant_cfg_key(&self, tenant_id: &str) -> String {
        format!("{}:{tenant_id}", self.config.tenantcfg_prefix)
    }

    /// Resolve a dialed number to a tenant id
    pub async fn resolve_did(&self, e164: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let tenant: Option<String> = redis::cmd("GET")
            .arg(self.did_key(e164))
            .query_async(&mut conn)
            .await
            .context("did lookup")?;
        Ok(tenant)
    }

    /// Load the tenant's configuration JSON; absent tenants get defaults
    pub async fn tenant_config(&self, tenant_id: &str) -> Result<TenantConfig> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.tenant_cfg_key(tenant_id))
            .query_async(&mut conn)
            .await
            .context("tenant config lookup")?;
        match raw {
            Some(json) => {
                serde_json::from_str(&json).context("tenant config is not valid JSON")
            }
            None => Ok(TenantConfig::default()),
        }
    }
}

/// UTC minute bucket: `YYYYMMDDHHMM`
pub fn minute_bucket(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn capacity_config() -> CapacityConfig {
        CapacityConfig {
            redis_url: "redis://127.0.0.1:6379".into(),
            global_concurrency_cap: 2,
            tenant_concurrency_cap_default: 5,
            tenant_calls_per_min_cap_default: 10,
            capacity_ttl_seconds: 7_200,
            tenantmap_prefix: "vx:map".into(),
            tenantcfg_prefix: "vx:cfg".into(),
            cap_prefix: "vx:cap".into(),
        }
    }

    #[test]
    fn test_minute_bucket_format() {
        let t = Utc.with_ymd_and_hms(2025, 3, 7, 9, 5, 59).unwrap();
        assert_eq!(minute_bucket(t), "202503070905");
        let t2 = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 0).unwrap();
        assert_eq!(minute_bucket(t2), "202512312359");
    }

    #[test]
    fn test_rpm_ttl_covers_two_buckets() {
        // First increment of a minute bucket sets a 120 s TTL
        assert!(ACQUIRE_SCRIPT.contains("EXPIRE', KEYS[3], 120"));
    }

    #[test]
    fn test_script_checks_in_documented_order() {
        let global = ACQUIRE_SCRIPT.find("global_at_capacity").unwrap();
        let tenant = ACQUIRE_SCRIPT.find("tenant_at_capacity").unwrap();
        let rpm = ACQUIRE_SCRIPT.find("tenant_rate_limited").unwrap();
        assert!(global < tenant && tenant < rpm);
        // Idempotent re-admit is decided before any capacity check
        let sismember = ACQUIRE_SCRIPT.find("SISMEMBER").unwrap();
        assert!(sismember < global);
    }

    // The atomicity and idempotence contracts need a live store; run with
    // `cargo test -- --ignored` against a local redis.
    #[tokio::test]
    #[ignore]
    async fn test_acquire_release_against_live_redis() {
        let service = CapacityService::connect(capacity_config()).await.unwrap();
        let now = Utc::now();
        let tenant = format!("t-{}", uuid::Uuid::new_v4());

        // Fill the global cap of 2
        assert_eq!(
            service.try_acquire(&tenant, "cc-1", now).await.unwrap(),
            Admission::Admitted
        );
        assert_eq!(
            service.try_acquire(&tenant, "cc-2", now).await.unwrap(),
            Admission::Admitted
        );
        assert_eq!(
            service.try_acquire(&tenant, "cc-3", now).await.unwrap(),
            Admission::Denied(DenyReason::GlobalAtCapacity)
        );

        // Idempotent re-admit of an existing id still succeeds
        assert_eq!(
            service.try_acquire(&tenant, "cc-1", now).await.unwrap(),
            Admission::Admitted
        );

        service.release(&tenant, "cc-1").await.unwrap();
        service.release(&tenant, "cc-2").await.unwrap();
        assert_eq!(
            service.try_acquire(&tenant, "cc-3", now).await.unwrap(),
            Admission::Admitted
        );
        service.release(&tenant, "cc-3").await.unwrap();
    }

    #[test]
    fn test_key_layout() {
        // Key shapes are part of the external contract; build them without
        // a live connection by formatting directly
        let cfg = capacity_config();
        assert_eq!(
            format!("{}:tenant:{}:active", cfg.cap_prefix, "t1"),
            "vx:cap:tenant:t1:active"
        );
        assert_eq!(
            format!("{}:did:{}", cfg.tenantmap_prefix, "+15551234567"),
            "vx:map:did:+15551234567"
        );
    }
}

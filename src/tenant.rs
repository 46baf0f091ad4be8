use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::closer;
use crate::engine::{AllocationPolicy, Engine};
use crate::gate::AuthorizationGate;
use crate::limits::*;
use crate::notify::NotifyHub;

/// Per-club engines. Each tenant gets its own Engine + WAL + closer.
/// Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    gate: Arc<dyn AuthorizationGate>,
    policy: AllocationPolicy,
}

impl TenantManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        gate: Arc<dyn AuthorizationGate>,
        policy: AllocationPolicy,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            gate,
            policy,
        }
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Keep the WAL file inside data_dir.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two first connections may race here; the map keeps exactly one engine.
        let entry = self.engines.entry(tenant.to_string());
        if let dashmap::mapref::entry::Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }
        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let notify = Arc::new(NotifyHub::new());
        let engine = Arc::new(Engine::with_policy(
            wal_path,
            notify,
            self.gate.clone(),
            self.policy.clone(),
        )?);
        entry.or_insert(engine.clone());

        let closer_engine = engine.clone();
        tokio::spawn(async move {
            closer::run_closer(closer_engine).await;
        });
        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            closer::run_compactor(compactor_engine, threshold).await;
        });

        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("tenant {safe_name} loaded");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::RoleDirectory;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtside_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        let roles = Arc::new(RoleDirectory::with_admins([ActorId::from("admin")]));
        TenantManager::new(dir, 1000, roles, AllocationPolicy::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));
        let admin = ActorId::from("admin");

        let club_a = tm.get_or_create("club_a").unwrap();
        let club_b = tm.get_or_create("club_b").unwrap();

        // Same ids in both clubs.
        let ev = Ulid::new();
        let court = Ulid::new();
        for engine in [&club_a, &club_b] {
            engine
                .create_event(ev, "Open night", 0, "Club", None, &admin)
                .await
                .unwrap();
            engine
                .add_court(court, ev, "Court 1", 1, true, 1, &admin)
                .await
                .unwrap();
        }

        club_a.register(ev, &ActorId::from("ana"), court).await.unwrap();

        let a = club_a.snapshot(ev).await.unwrap();
        let b = club_b.snapshot(ev).await.unwrap();
        assert_eq!(a.courts[0].occupied, 1);
        assert_eq!(b.courts[0].occupied, 0);
    }

    #[tokio::test]
    async fn captains_scoped_to_their_club() {
        let tm = manager(test_data_dir("captain_scope"));
        let admin = ActorId::from("admin");
        let club_a = tm.get_or_create("club_a").unwrap();
        let club_b = tm.get_or_create("club_b").unwrap();

        let ev = Ulid::new();
        let court = Ulid::new();
        for engine in [&club_a, &club_b] {
            engine
                .create_event(ev, "Open night", 0, "Club", None, &admin)
                .await
                .unwrap();
            engine
                .add_court(court, ev, "Court 1", 2, true, 1, &admin)
                .await
                .unwrap();
        }
        let mallory = ActorId::from("mallory");
        club_a.assign_captain(ev, mallory.clone(), &admin).await.unwrap();

        let bob = club_b.register(ev, &ActorId::from("bob"), court).await.unwrap();
        assert_eq!(
            club_b.cancel(bob.registration_id, &mallory).await.unwrap_err(),
            crate::engine::EngineError::NotAuthorized
        );
        assert!(club_b.captains(ev).await.unwrap().is_empty());

        let ana = club_a.register(ev, &ActorId::from("ana"), court).await.unwrap();
        assert!(club_a.cancel(ana.registration_id, &mallory).await.is_ok());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());

        let _eng = tm.get_or_create("my_club").unwrap();
        assert!(dir.join("my_club.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }
}

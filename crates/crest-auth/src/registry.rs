//! Device registry — find-or-create with cross-account reclaim.
//!
//! A client handle belongs to at most one device across all users. Seeing a
//! known handle under a different account means the client was reset or
//! handed over: the old device row is destroyed together with its pre-keys,
//! sessions, and refresh tokens, and a fresh device is created. Device
//! numbers stay dense per user because assignment runs inside the write
//! serializer.

use crest_common::error::{CrestError, CrestResult};
use crest_common::models::device::Device;
use crest_db::Database;
use crest_db::repository::devices;
use std::sync::Arc;
use uuid::Uuid;

use crate::geo::GeoLookup;

pub struct DeviceRegistry {
    db: Database,
    geo: Arc<dyn GeoLookup>,
}

impl DeviceRegistry {
    pub fn new(db: Database, geo: Arc<dyn GeoLookup>) -> Self {
        Self { db, geo }
    }

    /// Locate the caller's device, creating or reclaiming as needed, and
    /// refresh its sighting metadata.
    pub async fn find_or_create(
        &self,
        user_id: Uuid,
        client_handle: &str,
        ip: Option<&str>,
        user_agent: Option<&str>,
    ) -> CrestResult<Device> {
        // Geo enrichment happens outside the serializer; it is slow,
        // best-effort, and must not hold the write queue.
        let location = match ip {
            Some(ip) => self.geo.lookup(ip).await,
            None => None,
        };

        let handle = client_handle.to_string();
        let ip = ip.map(String::from);
        let user_agent = user_agent.map(String::from);

        self.db
            .writer
            .enqueue("device-find-or-create", move |pool| async move {
                match devices::find_by_handle(&pool, &handle)
                    .await
                    .map_err(CrestError::Internal)?
                {
                    Some(existing) if existing.user_id == user_id => {
                        devices::touch(
                            &pool,
                            user_id,
                            existing.device_id,
                            ip.as_deref(),
                            user_agent.as_deref(),
                            location.as_deref(),
                        )
                        .await
                        .map_err(CrestError::Internal)?;
                        devices::find(&pool, user_id, existing.device_id)
                            .await
                            .map_err(CrestError::Internal)?
                            .ok_or(CrestError::DeviceNotFound)
                    }
                    Some(foreign) => {
                        tracing::info!(
                            client_handle = %handle,
                            old_user = %foreign.user_id,
                            new_user = %user_id,
                            "reclaiming client handle from another account"
                        );
                        devices::delete_by_handle(&pool, &handle)
                            .await
                            .map_err(CrestError::Internal)?;
                        devices::create(
                            &pool,
                            user_id,
                            &handle,
                            ip.as_deref(),
                            user_agent.as_deref(),
                            location.as_deref(),
                        )
                        .await
                        .map_err(CrestError::Internal)
                    }
                    None => devices::create(
                        &pool,
                        user_id,
                        &handle,
                        ip.as_deref(),
                        user_agent.as_deref(),
                        location.as_deref(),
                    )
                    .await
                    .map_err(CrestError::Internal),
                }
            })
            .await
    }

    /// Remove one of the caller's devices. Removing the device the current
    /// session runs on is refused; the user must act from another session.
    pub async fn remove(
        &self,
        user_id: Uuid,
        device_id: i64,
        current_client_handle: &str,
    ) -> CrestResult<()> {
        let current = current_client_handle.to_string();
        self.db
            .writer
            .enqueue("device-remove", move |pool| async move {
                let device = devices::find(&pool, user_id, device_id)
                    .await
                    .map_err(CrestError::Internal)?
                    .ok_or(CrestError::DeviceNotFound)?;
                if device.client_handle == current {
                    return Err(CrestError::CurrentDeviceRefused);
                }
                devices::delete(&pool, user_id, device_id)
                    .await
                    .map_err(CrestError::Internal)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::NoopGeoLookup;
    use crest_db::repository::{prekeys, sessions, users};

    async fn setup() -> (Database, DeviceRegistry, Uuid, Uuid) {
        let db = Database::connect_in_memory().await.unwrap();
        let alice = users::create_if_absent(&db.pool, "alice@example.com").await.unwrap();
        let bob = users::create_if_absent(&db.pool, "bob@example.com").await.unwrap();
        let registry = DeviceRegistry::new(db.clone(), Arc::new(NoopGeoLookup));
        (db, registry, alice.id, bob.id)
    }

    #[tokio::test]
    async fn device_numbers_are_dense_from_one() {
        let (_db, registry, alice, _bob) = setup().await;
        let d1 = registry.find_or_create(alice, "h-1", None, None).await.unwrap();
        let d2 = registry.find_or_create(alice, "h-2", None, None).await.unwrap();
        let d3 = registry.find_or_create(alice, "h-3", None, None).await.unwrap();
        assert_eq!((d1.device_id, d2.device_id, d3.device_id), (1, 2, 3));

        // A repeat sighting keeps the same number.
        let again = registry.find_or_create(alice, "h-2", Some("10.0.0.9"), None).await.unwrap();
        assert_eq!(again.device_id, 2);
    }

    #[tokio::test]
    async fn reclaim_destroys_the_old_account_rows() {
        let (db, registry, alice, bob) = setup().await;
        let old = registry.find_or_create(alice, "shared", None, None).await.unwrap();
        prekeys::upsert_one_time_bulk(&db.pool, alice, old.device_id, &[(1, "AA==".into())])
            .await
            .unwrap();
        sessions::upsert_hmac(
            &db.pool,
            "shared",
            alice,
            old.device_id,
            "00",
            None,
            chrono::Utc::now() + chrono::Duration::days(1),
        )
        .await
        .unwrap();

        let new = registry.find_or_create(bob, "shared", None, None).await.unwrap();
        assert_eq!(new.user_id, bob);
        assert_eq!(new.device_id, 1);

        // Everything keyed by the handle under alice is gone.
        assert!(devices::find(&db.pool, alice, old.device_id).await.unwrap().is_none());
        assert_eq!(prekeys::count_one_time(&db.pool, alice, old.device_id).await.unwrap(), 0);
        let s = sessions::find_hmac(&db.pool, "shared").await.unwrap();
        assert!(s.is_none());
    }

    #[tokio::test]
    async fn removing_the_current_device_is_refused() {
        let (_db, registry, alice, _bob) = setup().await;
        let d = registry.find_or_create(alice, "h-cur", None, None).await.unwrap();
        assert!(matches!(
            registry.remove(alice, d.device_id, "h-cur").await,
            Err(CrestError::CurrentDeviceRefused)
        ));

        let other = registry.find_or_create(alice, "h-other", None, None).await.unwrap();
        registry.remove(alice, other.device_id, "h-cur").await.unwrap();
    }
}

use crate::{
    db::DbPool,
    entities::device::{self, Entity as DeviceEntity},
    errors::ServiceError,
};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

/// Read-side device views. Devices without a position are excluded from
/// area views; replaced devices show up in the unused list until the
/// warehouse takes them back.
#[derive(Clone)]
pub struct DeviceService {
    db_pool: Arc<DbPool>,
}

impl DeviceService {
    pub fn new(db_pool: Arc<DbPool>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self))]
    pub async fn get_device(&self, device_id: Uuid) -> Result<device::Model, ServiceError> {
        DeviceEntity::find_by_id(device_id)
            .one(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("device {} not found", device_id)))
    }

    /// Devices installed in an area. Unpositioned devices never match: a
    /// null area is not part of any area view.
    #[instrument(skip(self))]
    pub async fn list_by_area(&self, area_id: Uuid) -> Result<Vec<device::Model>, ServiceError> {
        DeviceEntity::find()
            .filter(device::Column::AreaId.eq(area_id))
            .filter(device::Column::DeletedAt.is_null())
            .order_by_asc(device::Column::PositionX)
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Devices that have no position yet (spares awaiting installation).
    #[instrument(skip(self))]
    pub async fn list_unpositioned(&self) -> Result<Vec<device::Model>, ServiceError> {
        DeviceEntity::find()
            .filter(device::Column::AreaId.is_null())
            .filter(device::Column::DeletedAt.is_null())
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Replaced devices: unpositioned and no longer active.
    #[instrument(skip(self))]
    pub async fn list_unused(&self) -> Result<Vec<device::Model>, ServiceError> {
        DeviceEntity::find()
            .filter(device::Column::AreaId.is_null())
            .filter(device::Column::Active.eq(false))
            .filter(device::Column::DeletedAt.is_null())
            .all(&*self.db_pool)
            .await
            .map_err(ServiceError::db_error)
    }
}

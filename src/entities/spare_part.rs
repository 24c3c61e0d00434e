use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The `spare_parts` table. `quantity` never goes negative; it is only
/// decremented through the ledger's guarded debit.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "spare_parts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub quantity: i32,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::issue_spare_part::Entity")]
    IssueSpareParts,
}

impl Related<super::issue_spare_part::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::IssueSpareParts.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

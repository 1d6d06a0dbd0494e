use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Moderation state of a listing. `Deleted` is a soft delete.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ListingStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "approved")]
    Approved,
    #[sea_orm(string_value = "rejected")]
    Rejected,
    #[sea_orm(string_value = "deleted")]
    Deleted,
}

/// Spare luggage capacity offered by a travelling seller.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "listings")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub seller_id: Uuid,
    pub title: String,

    pub origin: String,
    pub origin_airport: Option<String>,
    pub destination: String,
    pub destination_airport: Option<String>,
    pub travel_date: NaiveDate,

    pub currency: String,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub price_per_kg: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub total_weight: Decimal,
    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub remaining_weight: Decimal,
    #[sea_orm(column_type = "Decimal(Some((5, 2)))")]
    pub discount_percent: Decimal,

    pub origin_phone: Option<String>,
    pub destination_phone: Option<String>,
    pub passport_photo_url: Option<String>,
    pub ticket_copy_url: Option<String>,
    pub pickup_note: Option<String>,

    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    /// Price for `weight` after the listing discount, rounded to cents.
    pub fn price_for(&self, weight: Decimal) -> Decimal {
        price_for(self.price_per_kg, weight, self.discount_percent)
    }

    pub fn total_price(&self) -> Decimal {
        self.price_for(self.total_weight)
    }

    /// Weight already committed to orders.
    pub fn sold_weight(&self) -> Decimal {
        self.total_weight - self.remaining_weight
    }

    pub fn is_open_for_purchase(&self) -> bool {
        self.status == ListingStatus::Approved
    }
}

/// Saturates at `Decimal::MAX` instead of overflowing.
pub fn price_for(price_per_kg: Decimal, weight: Decimal, discount_percent: Decimal) -> Decimal {
    let gross = price_per_kg.saturating_mul(weight);
    let discount = gross.saturating_mul(discount_percent) / Decimal::ONE_HUNDRED;
    (gross - discount).round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::SellerId",
        to = "super::user::Column::Id"
    )]
    Seller,
    #[sea_orm(has_many = "super::order::Entity")]
    Orders,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Seller.def()
    }
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Orders.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

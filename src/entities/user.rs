use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which payout destination a seller has on file.
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
pub enum PayoutMethodType {
    #[sea_orm(string_value = "none")]
    None,
    #[sea_orm(string_value = "bank")]
    Bank,
    #[sea_orm(string_value = "card")]
    Card,
    #[sea_orm(string_value = "mobile_banking")]
    MobileBanking,
    #[sea_orm(string_value = "payid")]
    PayId,
}

/// Local mirror of an identity-provider account, plus payout details.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub full_name: Option<String>,
    #[sea_orm(unique)]
    pub email: String,
    pub phone: Option<String>,
    pub phone_verified: bool,
    pub is_admin: bool,
    pub is_active: bool,

    pub payout_method: PayoutMethodType,
    pub bank_account_name: Option<String>,
    pub bank_name: Option<String>,
    pub bank_routing: Option<String>,
    #[serde(skip_serializing)]
    pub bank_account_number: Option<String>,
    pub card_holder_name: Option<String>,
    pub card_brand: Option<String>,
    pub card_last4: Option<String>,
    pub card_exp_month: Option<i32>,
    pub card_exp_year: Option<i32>,
    pub mobile_banking_number: Option<String>,
    pub payid_identifier: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::listing::Entity")]
    Listings,
    #[sea_orm(has_many = "super::order::Entity")]
    Orders,
}

impl Related<super::listing::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Listings.def()
    }
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Orders.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::services::codes::PENDING_CODE;

/// Lifecycle of a purchase.
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
pub enum OrderStatus {
    #[sea_orm(string_value = "pending_payment")]
    PendingPayment,
    #[sea_orm(string_value = "payment_failed")]
    PaymentFailed,
    #[sea_orm(string_value = "pending_handover")]
    PendingHandover,
    #[sea_orm(string_value = "in_transit")]
    InTransit,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "disputed")]
    Disputed,
}

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
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "manual_review")]
    ManualReview,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

/// How a payment is settled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentFamily {
    /// Confirmed synchronously by a processor.
    Instant,
    /// Off-platform transfer confirmed by an administrator.
    Manual,
}

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
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(40))")]
#[strum(ascii_case_insensitive)]
pub enum PaymentMethod {
    #[sea_orm(string_value = "STRIPE")]
    #[serde(rename = "STRIPE")]
    #[strum(serialize = "STRIPE")]
    Stripe,
    #[sea_orm(string_value = "PAYPAL")]
    #[serde(rename = "PAYPAL")]
    #[strum(serialize = "PAYPAL")]
    PayPal,
    #[sea_orm(string_value = "WISE")]
    #[serde(rename = "WISE")]
    #[strum(serialize = "WISE")]
    Wise,
    #[sea_orm(string_value = "BANK_ACCOUNT")]
    #[serde(rename = "BANK_ACCOUNT")]
    #[strum(serialize = "BANK_ACCOUNT")]
    BankAccount,
    #[sea_orm(string_value = "MOBILE_BANKING_BKASH_NAGAD")]
    #[serde(rename = "MOBILE_BANKING_BKASH_NAGAD")]
    #[strum(serialize = "MOBILE_BANKING_BKASH_NAGAD")]
    MobileBanking,
    #[sea_orm(string_value = "PAYID")]
    #[serde(rename = "PAYID")]
    #[strum(serialize = "PAYID")]
    PayId,
    #[sea_orm(string_value = "BKASH_TO_BANK")]
    #[serde(rename = "BKASH_TO_BANK")]
    #[strum(serialize = "BKASH_TO_BANK")]
    BkashToBank,
}

impl PaymentMethod {
    /// Parses a user-supplied method name, ignoring case and surrounding whitespace.
    pub fn parse(value: &str) -> Result<Self, ServiceError> {
        PaymentMethod::from_str(value.trim()).map_err(|_| {
            ServiceError::invalid(
                "payment_method",
                format!("unsupported payment method '{}'", value.trim()),
            )
        })
    }

    pub fn family(&self) -> PaymentFamily {
        match self {
            PaymentMethod::Stripe | PaymentMethod::PayPal => PaymentFamily::Instant,
            PaymentMethod::Wise
            | PaymentMethod::BankAccount
            | PaymentMethod::MobileBanking
            | PaymentMethod::PayId
            | PaymentMethod::BkashToBank => PaymentFamily::Manual,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PaymentMethod::Stripe => "Credit/Debit Card (Stripe)",
            PaymentMethod::PayPal => "PayPal",
            PaymentMethod::Wise => "Wise Transfer",
            PaymentMethod::BankAccount => "Bank Account Transfer",
            PaymentMethod::MobileBanking => "Mobile Banking (bKash/Nagad)",
            PaymentMethod::PayId => "PayID",
            PaymentMethod::BkashToBank => "bKash to Bank Transfer",
        }
    }
}

/// The two seller-administered code challenges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerificationLeg {
    /// Buyer hands the parcel to the seller at origin.
    Handover,
    /// Seller hands the parcel to the receiver at destination.
    Delivery,
}

/// A buyer's purchase against a listing.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub tracking_number: String,
    pub listing_id: Uuid,
    pub buyer_id: Uuid,

    #[sea_orm(column_type = "Decimal(Some((10, 2)))")]
    pub purchased_weight: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub purchase_price: Decimal,
    pub currency: String,

    pub receiver_name: String,
    pub receiver_phone: String,
    pub receiver_email: Option<String>,
    pub delivery_address: String,
    pub delivery_postcode: Option<String>,
    pub delivery_country: String,

    pub payment_method: Option<PaymentMethod>,
    pub payment_status: PaymentStatus,
    pub payment_transaction_id: Option<String>,
    pub payment_reference: Option<String>,
    pub payment_receipt_url: Option<String>,
    pub gateway_intent_id: Option<String>,

    #[serde(skip_serializing)]
    pub handover_code: String,
    #[serde(skip_serializing)]
    pub delivery_code: String,
    pub handover_verified_at: Option<DateTime<Utc>>,
    pub delivery_verified_at: Option<DateTime<Utc>>,
    pub handover_attempts: i32,
    pub delivery_attempts: i32,
    pub handover_photo_url: Option<String>,
    pub delivery_photo_url: Option<String>,

    pub sender_id_url: Option<String>,
    pub luggage_photo_url: Option<String>,

    pub status: OrderStatus,
    #[sea_orm(column_type = "Text", nullable)]
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i32,
}

impl Model {
    /// Real codes have replaced the placeholder.
    pub fn codes_issued(&self) -> bool {
        self.handover_code != PENDING_CODE && self.delivery_code != PENDING_CODE
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
    }

    pub fn attempts(&self, leg: VerificationLeg) -> i32 {
        match leg {
            VerificationLeg::Handover => self.handover_attempts,
            VerificationLeg::Delivery => self.delivery_attempts,
        }
    }

    pub fn verified_at(&self, leg: VerificationLeg) -> Option<DateTime<Utc>> {
        match leg {
            VerificationLeg::Handover => self.handover_verified_at,
            VerificationLeg::Delivery => self.delivery_verified_at,
        }
    }

    pub fn stored_code(&self, leg: VerificationLeg) -> &str {
        match leg {
            VerificationLeg::Handover => &self.handover_code,
            VerificationLeg::Delivery => &self.delivery_code,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::listing::Entity",
        from = "Column::ListingId",
        to = "super::listing::Column::Id"
    )]
    Listing,
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::BuyerId",
        to = "super::user::Column::Id"
    )]
    Buyer,
    #[sea_orm(has_many = "super::order_note::Entity")]
    Notes,
}

impl Related<super::listing::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Listing.def()
    }
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Buyer.def()
    }
}

impl Related<super::order_note::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Notes.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

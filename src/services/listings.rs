use crate::{
    auth::Actor,
    db::DbPool,
    entities::{
        listing::{
            self, ActiveModel as ListingActiveModel, Entity as ListingEntity,
            Model as ListingModel, ListingStatus,
        },
        user::Entity as UserEntity,
    },
    errors::ServiceError,
    events::{publish, Event, EventSender},
};
use chrono::{NaiveDate, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::{Validate, ValidationError};

const MAX_PICKUP_NOTE_WORDS: usize = 100;

lazy_static! {
    static ref CURRENCY_CODE: Regex = Regex::new(r"^[A-Z]{3}$").unwrap();
    static ref AIRPORT_CODE: Regex = Regex::new(r"^[A-Z]{3}$").unwrap();
    static ref PHONE_NUMBER: Regex = Regex::new(r"^\+?[0-9][0-9 ()-]{5,19}$").unwrap();
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateListingRequest {
    #[validate(length(min = 1, max = 200, message = "Title is required"))]
    pub title: String,
    #[validate(length(min = 1, max = 100, message = "Origin is required"))]
    pub origin: String,
    #[validate(regex(path = "AIRPORT_CODE", message = "Airport must be a 3-letter IATA code"))]
    pub origin_airport: Option<String>,
    #[validate(length(min = 1, max = 100, message = "Destination is required"))]
    pub destination: String,
    #[validate(regex(path = "AIRPORT_CODE", message = "Airport must be a 3-letter IATA code"))]
    pub destination_airport: Option<String>,
    pub travel_date: NaiveDate,
    #[validate(regex(path = "CURRENCY_CODE", message = "Currency must be a 3-letter uppercase code"))]
    pub currency: String,
    #[validate(custom = "validate_price_per_kg")]
    pub price_per_kg: Decimal,
    #[validate(custom = "validate_weight")]
    pub total_weight: Decimal,
    #[validate(custom = "validate_discount")]
    pub discount_percent: Decimal,
    #[validate(regex(path = "PHONE_NUMBER", message = "Invalid phone number"))]
    pub origin_phone: Option<String>,
    #[validate(regex(path = "PHONE_NUMBER", message = "Invalid phone number"))]
    pub destination_phone: Option<String>,
    #[validate(length(max = 500))]
    pub passport_photo_url: Option<String>,
    #[validate(length(max = 500))]
    pub ticket_copy_url: Option<String>,
    #[validate(custom = "validate_pickup_note")]
    pub pickup_note: Option<String>,
}

/// Partial edit; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdateListingRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: Option<String>,
    pub travel_date: Option<NaiveDate>,
    #[validate(custom = "validate_price_per_kg")]
    pub price_per_kg: Option<Decimal>,
    #[validate(custom = "validate_weight")]
    pub total_weight: Option<Decimal>,
    #[validate(custom = "validate_discount")]
    pub discount_percent: Option<Decimal>,
    #[validate(regex(path = "PHONE_NUMBER", message = "Invalid phone number"))]
    pub origin_phone: Option<String>,
    #[validate(regex(path = "PHONE_NUMBER", message = "Invalid phone number"))]
    pub destination_phone: Option<String>,
    #[validate(custom = "validate_pickup_note")]
    pub pickup_note: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingDecision {
    Approve,
    Reject,
}

/// What anyone may see of an approved listing. No phones, no documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicListing {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub title: String,
    pub origin: String,
    pub origin_airport: Option<String>,
    pub destination: String,
    pub destination_airport: Option<String>,
    pub travel_date: NaiveDate,
    pub currency: String,
    pub price_per_kg: Decimal,
    pub total_weight: Decimal,
    pub remaining_weight: Decimal,
    pub discount_percent: Decimal,
    pub total_price: Decimal,
    pub pickup_note: Option<String>,
}

impl From<&ListingModel> for PublicListing {
    fn from(listing: &ListingModel) -> Self {
        Self {
            id: listing.id,
            seller_id: listing.seller_id,
            title: listing.title.clone(),
            origin: listing.origin.clone(),
            origin_airport: listing.origin_airport.clone(),
            destination: listing.destination.clone(),
            destination_airport: listing.destination_airport.clone(),
            travel_date: listing.travel_date,
            currency: listing.currency.clone(),
            price_per_kg: listing.price_per_kg,
            total_weight: listing.total_weight,
            remaining_weight: listing.remaining_weight,
            discount_percent: listing.discount_percent,
            total_price: listing.total_price(),
            pickup_note: listing.pickup_note.clone(),
        }
    }
}

fn validate_bounded(value: Decimal, max: Decimal) -> Result<(), ValidationError> {
    if value <= Decimal::ZERO {
        Err(ValidationError::new("must_be_positive"))
    } else if value > max {
        Err(ValidationError::new("too_large"))
    } else {
        Ok(())
    }
}

/// Capped at what a NUMERIC(12,2) column holds.
fn validate_price_per_kg(value: &Decimal) -> Result<(), ValidationError> {
    validate_bounded(*value, Decimal::new(999_999_999_999, 2))
}

/// Capped at what a NUMERIC(10,2) column holds.
fn validate_weight(value: &Decimal) -> Result<(), ValidationError> {
    validate_bounded(*value, Decimal::new(9_999_999_999, 2))
}

fn validate_discount(value: &Decimal) -> Result<(), ValidationError> {
    if *value >= Decimal::ZERO && *value <= Decimal::ONE_HUNDRED {
        Ok(())
    } else {
        Err(ValidationError::new("discount_out_of_range"))
    }
}

/// Pickup notes are free text but must not smuggle contact details.
fn validate_pickup_note(note: &str) -> Result<(), ValidationError> {
    if note.split_whitespace().count() > MAX_PICKUP_NOTE_WORDS {
        return Err(ValidationError::new("pickup_note_too_long"));
    }
    if note.chars().any(|c| c.is_ascii_digit() || c == '@') {
        return Err(ValidationError::new("pickup_note_contains_contact_details"));
    }
    Ok(())
}

fn ensure_not_in_past(travel_date: NaiveDate) -> Result<(), ServiceError> {
    if travel_date < Utc::now().date_naive() {
        return Err(ServiceError::invalid(
            "travel_date",
            "travel date cannot be in the past",
        ));
    }
    Ok(())
}

/// Seller-side listing management and the capacity ledger orders draw from.
#[derive(Clone)]
pub struct ListingService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl ListingService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    #[instrument(skip(self, request), fields(seller_id = %actor.user_id))]
    pub async fn create_listing(
        &self,
        actor: &Actor,
        request: CreateListingRequest,
    ) -> Result<ListingModel, ServiceError> {
        request.validate()?;
        ensure_not_in_past(request.travel_date)?;

        let db = &*self.db_pool;
        let seller = UserEntity::find_by_id(actor.user_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("User {} not found", actor.user_id)))?;
        if !seller.is_active {
            return Err(ServiceError::Forbidden("Account is deactivated".to_string()));
        }
        if !seller.phone_verified {
            return Err(ServiceError::Forbidden(
                "A verified phone number is required to publish a listing".to_string(),
            ));
        }

        let now = Utc::now();
        let listing_id = Uuid::new_v4();
        let model = ListingActiveModel {
            id: Set(listing_id),
            seller_id: Set(seller.id),
            title: Set(request.title.trim().to_string()),
            origin: Set(request.origin.trim().to_string()),
            origin_airport: Set(request.origin_airport),
            destination: Set(request.destination.trim().to_string()),
            destination_airport: Set(request.destination_airport),
            travel_date: Set(request.travel_date),
            currency: Set(request.currency),
            price_per_kg: Set(request.price_per_kg),
            total_weight: Set(request.total_weight),
            remaining_weight: Set(request.total_weight),
            discount_percent: Set(request.discount_percent),
            origin_phone: Set(request.origin_phone),
            destination_phone: Set(request.destination_phone),
            passport_photo_url: Set(request.passport_photo_url),
            ticket_copy_url: Set(request.ticket_copy_url),
            pickup_note: Set(request.pickup_note),
            status: Set(ListingStatus::Pending),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .map_err(|e| {
            error!(error = %e, listing_id = %listing_id, "Failed to create listing");
            ServiceError::DatabaseError(e)
        })?;

        info!(listing_id = %listing_id, "Listing created, awaiting moderation");
        publish(&self.event_sender, Event::ListingCreated(listing_id)).await;
        Ok(model)
    }

    /// Any listing by id, whatever its moderation state.
    #[instrument(skip(self))]
    pub async fn get_listing(&self, listing_id: Uuid) -> Result<ListingModel, ServiceError> {
        load_listing(&*self.db_pool, listing_id).await
    }

    /// The public projection of an approved listing.
    #[instrument(skip(self))]
    pub async fn public_listing(&self, listing_id: Uuid) -> Result<PublicListing, ServiceError> {
        let listing = load_listing(&*self.db_pool, listing_id).await?;
        if listing.status != ListingStatus::Approved {
            return Err(ServiceError::NotFound(format!(
                "Listing {} not found",
                listing_id
            )));
        }
        Ok(PublicListing::from(&listing))
    }

    /// Approved listings with capacity left, soonest departure first.
    #[instrument(skip(self))]
    pub async fn approved_listings(&self) -> Result<Vec<PublicListing>, ServiceError> {
        let listings = ListingEntity::find()
            .filter(listing::Column::Status.eq(ListingStatus::Approved))
            .filter(listing::Column::RemainingWeight.gt(Decimal::ZERO))
            .filter(listing::Column::TravelDate.gte(Utc::now().date_naive()))
            .order_by_asc(listing::Column::TravelDate)
            .all(&*self.db_pool)
            .await?;
        Ok(listings.iter().map(PublicListing::from).collect())
    }

    #[instrument(skip(self), fields(admin_id = %actor.user_id))]
    pub async fn moderate_listing(
        &self,
        actor: &Actor,
        listing_id: Uuid,
        decision: ListingDecision,
    ) -> Result<ListingModel, ServiceError> {
        actor.require_admin()?;
        let db = &*self.db_pool;
        let listing = load_listing(db, listing_id).await?;
        if listing.status == ListingStatus::Deleted {
            return Err(ServiceError::StateConflict(
                "Deleted listings cannot be moderated".to_string(),
            ));
        }

        let status = match decision {
            ListingDecision::Approve => ListingStatus::Approved,
            ListingDecision::Reject => ListingStatus::Rejected,
        };
        let mut active: ListingActiveModel = listing.into();
        active.status = Set(status);
        active.updated_at = Set(Utc::now());
        let updated = active.update(db).await?;

        info!(listing_id = %listing_id, status = %status, "Listing moderated");
        publish(
            &self.event_sender,
            Event::ListingModerated { listing_id, status },
        )
        .await;
        Ok(updated)
    }

    #[instrument(skip(self, request), fields(actor_id = %actor.user_id))]
    pub async fn update_listing(
        &self,
        actor: &Actor,
        listing_id: Uuid,
        request: UpdateListingRequest,
    ) -> Result<ListingModel, ServiceError> {
        request.validate()?;
        if let Some(date) = request.travel_date {
            ensure_not_in_past(date)?;
        }

        let db = &*self.db_pool;
        let listing = load_listing(db, listing_id).await?;
        actor.require_owner_or_admin(listing.seller_id, "listing")?;
        if listing.status == ListingStatus::Deleted {
            return Err(ServiceError::StateConflict(
                "Deleted listings cannot be edited".to_string(),
            ));
        }

        let resets_moderation =
            listing.status == ListingStatus::Approved && actor.user_id == listing.seller_id;
        let sold = listing.sold_weight();
        let mut active: ListingActiveModel = listing.into();

        if let Some(title) = request.title {
            active.title = Set(title.trim().to_string());
        }
        if let Some(date) = request.travel_date {
            active.travel_date = Set(date);
        }
        if let Some(price) = request.price_per_kg {
            active.price_per_kg = Set(price);
        }
        if let Some(total) = request.total_weight {
            if total < sold {
                return Err(ServiceError::invalid(
                    "total_weight",
                    format!("cannot be less than the {} kg already sold", sold),
                ));
            }
            active.total_weight = Set(total);
            active.remaining_weight = Set(total - sold);
        }
        if let Some(discount) = request.discount_percent {
            active.discount_percent = Set(discount);
        }
        if let Some(phone) = request.origin_phone {
            active.origin_phone = Set(Some(phone));
        }
        if let Some(phone) = request.destination_phone {
            active.destination_phone = Set(Some(phone));
        }
        if let Some(note) = request.pickup_note {
            active.pickup_note = Set(Some(note));
        }
        if resets_moderation {
            active.status = Set(ListingStatus::Pending);
        }
        active.updated_at = Set(Utc::now());

        let updated = active.update(db).await?;
        info!(listing_id = %listing_id, status = %updated.status, "Listing updated");
        publish(&self.event_sender, Event::ListingUpdated(listing_id)).await;
        Ok(updated)
    }

    /// Soft delete; the row stays for existing orders.
    #[instrument(skip(self), fields(actor_id = %actor.user_id))]
    pub async fn delete_listing(&self, actor: &Actor, listing_id: Uuid) -> Result<(), ServiceError> {
        let db = &*self.db_pool;
        let listing = load_listing(db, listing_id).await?;
        actor.require_owner_or_admin(listing.seller_id, "listing")?;
        if listing.status == ListingStatus::Deleted {
            return Ok(());
        }

        let mut active: ListingActiveModel = listing.into();
        active.status = Set(ListingStatus::Deleted);
        active.updated_at = Set(Utc::now());
        active.update(db).await?;

        info!(listing_id = %listing_id, "Listing deleted");
        publish(&self.event_sender, Event::ListingDeleted(listing_id)).await;
        Ok(())
    }

    /// Takes `weight` out of the listing's remaining capacity.
    ///
    /// Succeeds only while the listing is approved and has enough left, checked in the
    /// same statement that decrements it.
    pub async fn reserve_capacity<C: ConnectionTrait>(
        conn: &C,
        listing_id: Uuid,
        weight: Decimal,
    ) -> Result<(), ServiceError> {
        let result = ListingEntity::update_many()
            .col_expr(
                listing::Column::RemainingWeight,
                Expr::col(listing::Column::RemainingWeight).sub(weight),
            )
            .col_expr(listing::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(listing::Column::Id.eq(listing_id))
            .filter(listing::Column::Status.eq(ListingStatus::Approved))
            .filter(listing::Column::RemainingWeight.gte(weight))
            .exec(conn)
            .await?;

        if result.rows_affected != 1 {
            return Err(ServiceError::invalid(
                "weight",
                "exceeds the listing's remaining capacity",
            ));
        }
        Ok(())
    }

    /// Returns `weight` to the listing, never beyond its total.
    pub async fn release_capacity<C: ConnectionTrait>(
        conn: &C,
        listing_id: Uuid,
        weight: Decimal,
    ) -> Result<(), ServiceError> {
        let result = ListingEntity::update_many()
            .col_expr(
                listing::Column::RemainingWeight,
                Expr::col(listing::Column::RemainingWeight).add(weight),
            )
            .col_expr(listing::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(listing::Column::Id.eq(listing_id))
            .filter(
                Expr::expr(Expr::col(listing::Column::RemainingWeight).add(weight))
                    .lte(Expr::col(listing::Column::TotalWeight)),
            )
            .exec(conn)
            .await?;

        if result.rows_affected != 1 {
            return Err(ServiceError::StateConflict(format!(
                "Listing {} cannot take back {} kg",
                listing_id, weight
            )));
        }
        Ok(())
    }
}

pub(crate) async fn load_listing<C: ConnectionTrait>(
    conn: &C,
    listing_id: Uuid,
) -> Result<ListingModel, ServiceError> {
    ListingEntity::find_by_id(listing_id)
        .one(conn)
        .await
        .map_err(|e| {
            error!(error = %e, listing_id = %listing_id, "Failed to fetch listing");
            ServiceError::DatabaseError(e)
        })?
        .ok_or_else(|| ServiceError::NotFound(format!("Listing {} not found", listing_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn request() -> CreateListingRequest {
        CreateListingRequest {
            title: "Sydney to Dhaka".into(),
            origin: "Sydney".into(),
            origin_airport: Some("SYD".into()),
            destination: "Dhaka".into(),
            destination_airport: Some("DAC".into()),
            travel_date: Utc::now().date_naive() + Duration::days(10),
            currency: "AUD".into(),
            price_per_kg: dec!(10),
            total_weight: dec!(20),
            discount_percent: dec!(0),
            origin_phone: Some("+61 400 000 000".into()),
            destination_phone: None,
            passport_photo_url: None,
            ticket_copy_url: None,
            pickup_note: Some("Near the central station entrance".into()),
        }
    }

    #[test]
    fn well_formed_request_validates() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn price_and_weight_are_bounded_by_their_columns() {
        let mut largest = request();
        largest.price_per_kg = dec!(9999999999.99);
        largest.total_weight = dec!(99999999.99);
        assert!(largest.validate().is_ok());
        assert_eq!(
            listing::price_for(largest.price_per_kg, largest.total_weight, dec!(0)),
            dec!(999999999899000000.00)
        );

        let mut pricey = request();
        pricey.price_per_kg = dec!(100000000000000000000);
        assert!(pricey.validate().is_err());

        let mut heavy = request();
        heavy.total_weight = dec!(10000000000);
        assert!(heavy.validate().is_err());

        let update = UpdateListingRequest {
            price_per_kg: Some(dec!(10000000000)),
            ..Default::default()
        };
        assert!(update.validate().is_err());
        let saturated = listing::price_for(
            dec!(100000000000000000000),
            dec!(10000000000),
            dec!(10),
        );
        assert!(saturated > Decimal::ZERO);
    }

    #[test]
    fn lowercase_currency_is_rejected() {
        let mut req = request();
        req.currency = "aud".into();
        assert!(req.validate().is_err());
    }

    #[test]
    fn discount_must_be_a_percentage() {
        let mut req = request();
        req.discount_percent = dec!(101);
        assert!(req.validate().is_err());
        req.discount_percent = dec!(-1);
        assert!(req.validate().is_err());
    }

    #[test]
    fn weight_and_price_must_be_positive() {
        let mut req = request();
        req.total_weight = dec!(0);
        assert!(req.validate().is_err());
        let mut req = request();
        req.price_per_kg = dec!(-5);
        assert!(req.validate().is_err());
    }

    #[test]
    fn pickup_note_cannot_carry_contact_details() {
        assert!(validate_pickup_note("call me on 0400").is_err());
        assert!(validate_pickup_note("mail me at me@example").is_err());
        assert!(validate_pickup_note("meet by the fountain").is_ok());
        let long = "word ".repeat(101);
        assert!(validate_pickup_note(&long).is_err());
    }

    #[test]
    fn past_travel_date_is_rejected() {
        let yesterday = Utc::now().date_naive() - Duration::days(1);
        assert!(matches!(
            ensure_not_in_past(yesterday),
            Err(ServiceError::ValidationError(_))
        ));
    }
}

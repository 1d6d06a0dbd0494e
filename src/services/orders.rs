use crate::{
    auth::Actor,
    config::VerificationConfig,
    db::DbPool,
    entities::{
        listing::{self, Model as ListingModel},
        order::{
            self, ActiveModel as OrderActiveModel, Entity as OrderEntity, Model as OrderModel,
            OrderStatus, PaymentMethod, PaymentStatus, VerificationLeg,
        },
        order_note::{self, Entity as OrderNoteEntity, Model as OrderNoteModel},
        user::{self, Entity as UserEntity, Model as UserModel},
    },
    errors::ServiceError,
    events::{publish, Event, EventSender},
    services::{
        codes::{CodeGenerator, PENDING_CODE},
        contact_policy::{BuyerContact, ContactVisibility, SellerContact},
        listings::{load_listing, ListingService, PublicListing},
        order_status::{commit_order_changes, load_order, no_changes, OrderState},
    },
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

const TRACKING_SUFFIX_LENGTH: usize = 6;

/// Buyer input for a new purchase.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PurchaseRequest {
    pub listing_id: Uuid,
    pub weight: Decimal,
    #[validate(length(min = 1, max = 120, message = "Receiver name is required"))]
    pub receiver_name: String,
    #[validate(length(min = 6, max = 20, message = "Receiver phone is required"))]
    pub receiver_phone: String,
    #[validate(email)]
    pub receiver_email: Option<String>,
    #[validate(length(min = 1, max = 500, message = "Delivery address is required"))]
    pub delivery_address: String,
    #[validate(length(max = 20))]
    pub delivery_postcode: Option<String>,
    #[validate(length(min = 2, max = 60, message = "Delivery country is required"))]
    pub delivery_country: String,
    #[validate(length(min = 1, max = 500))]
    pub sender_id_url: Option<String>,
    #[validate(length(min = 1, max = 500))]
    pub luggage_photo_url: Option<String>,
}

/// Post-payment document upload. The sender's identity document is mandatory.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DocumentUpload {
    #[validate(length(min = 1, max = 500, message = "Sender ID document is required"))]
    pub sender_id_url: String,
    #[validate(length(min = 1, max = 500))]
    pub luggage_photo_url: Option<String>,
}

/// Codes as shown to the buyer once they exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealedCodes {
    pub handover: String,
    pub delivery: String,
}

/// The buyer's view of a purchase after checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuyerOrderSummary {
    pub order_id: Uuid,
    pub tracking_number: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub payment_method: Option<PaymentMethod>,
    pub purchased_weight: Decimal,
    pub purchase_price: Decimal,
    pub currency: String,
    pub listing: PublicListing,
    /// Set once paid and the sender ID is on file.
    pub codes: Option<RevealedCodes>,
    /// Paid but codes are still waiting on the sender ID upload.
    pub documents_required: bool,
    pub seller_contact: Option<SellerContact>,
    pub handover_verified_at: Option<DateTime<Utc>>,
    pub delivery_verified_at: Option<DateTime<Utc>>,
}

/// The seller's view of an order placed on one of their listings. Never carries codes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellerOrderView {
    pub order_id: Uuid,
    pub listing_id: Uuid,
    pub tracking_number: String,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub purchased_weight: Decimal,
    pub purchase_price: Decimal,
    pub currency: String,
    pub buyer_contact: Option<BuyerContact>,
    pub documents_uploaded: bool,
    pub handover_attempts_remaining: i32,
    pub delivery_attempts_remaining: i32,
    pub handover_verified_at: Option<DateTime<Utc>>,
    pub delivery_verified_at: Option<DateTime<Utc>>,
}

/// `MAA-YYYYMMDD-XXXXXX`
pub fn generate_tracking_number(now: DateTime<Utc>) -> String {
    format!(
        "MAA-{}-{}",
        now.format("%Y%m%d"),
        CodeGenerator::new(TRACKING_SUFFIX_LENGTH).generate()
    )
}

/// True when an order has become eligible for codes but does not hold them yet.
///
/// Eligibility needs both a settled payment and the sender's identity document,
/// whichever arrives last.
pub(crate) fn codes_due(order: &OrderModel, payment_status: PaymentStatus, has_sender_id: bool) -> bool {
    payment_status == PaymentStatus::Paid && has_sender_id && !order.codes_issued()
}

/// Adds a fresh handover/delivery pair to `changes`.
pub(crate) fn attach_codes(changes: &mut OrderActiveModel, generator: &CodeGenerator) {
    let codes = generator.generate_pair();
    changes.handover_code = Set(codes.handover);
    changes.delivery_code = Set(codes.delivery);
}

pub(crate) fn remaining_attempts(order: &OrderModel, leg: VerificationLeg, max_attempts: i32) -> i32 {
    (max_attempts - order.attempts(leg)).max(0)
}

#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    verification: VerificationConfig,
}

impl OrderService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        verification: VerificationConfig,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            verification,
        }
    }

    fn code_generator(&self) -> CodeGenerator {
        CodeGenerator::new(self.verification.code_length)
    }

    /// Places an order against an approved listing and reserves its weight.
    #[instrument(skip(self, request), fields(buyer_id = %actor.user_id, listing_id = %request.listing_id))]
    pub async fn purchase(
        &self,
        actor: &Actor,
        request: PurchaseRequest,
    ) -> Result<OrderModel, ServiceError> {
        request.validate()?;

        let db = &*self.db_pool;
        let listing = load_listing(db, request.listing_id).await?;

        if !listing.is_open_for_purchase() {
            return Err(ServiceError::StateConflict(
                "Listing is not available for purchase".to_string(),
            ));
        }
        if listing.travel_date < Utc::now().date_naive() {
            return Err(ServiceError::StateConflict(
                "Listing's travel date has already passed".to_string(),
            ));
        }
        if listing.seller_id == actor.user_id {
            return Err(ServiceError::Forbidden(
                "Sellers cannot purchase their own listing".to_string(),
            ));
        }
        if request.weight <= Decimal::ZERO {
            return Err(ServiceError::invalid("weight", "must be greater than zero"));
        }
        if request.weight > listing.remaining_weight {
            return Err(ServiceError::invalid(
                "weight",
                format!(
                    "only {} kg remaining on this listing",
                    listing.remaining_weight
                ),
            ));
        }

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let price = listing.price_for(request.weight);

        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for purchase");
            ServiceError::DatabaseError(e)
        })?;

        ListingService::reserve_capacity(&txn, listing.id, request.weight).await?;

        let order = OrderActiveModel {
            id: Set(order_id),
            tracking_number: Set(generate_tracking_number(now)),
            listing_id: Set(listing.id),
            buyer_id: Set(actor.user_id),
            purchased_weight: Set(request.weight),
            purchase_price: Set(price),
            currency: Set(listing.currency.clone()),
            receiver_name: Set(request.receiver_name.trim().to_string()),
            receiver_phone: Set(request.receiver_phone.trim().to_string()),
            receiver_email: Set(request.receiver_email),
            delivery_address: Set(request.delivery_address.trim().to_string()),
            delivery_postcode: Set(request.delivery_postcode),
            delivery_country: Set(request.delivery_country.trim().to_string()),
            payment_method: Set(None),
            payment_status: Set(OrderState::initial().payment_status),
            payment_transaction_id: Set(None),
            payment_reference: Set(None),
            payment_receipt_url: Set(None),
            gateway_intent_id: Set(None),
            handover_code: Set(PENDING_CODE.to_string()),
            delivery_code: Set(PENDING_CODE.to_string()),
            handover_verified_at: Set(None),
            delivery_verified_at: Set(None),
            handover_attempts: Set(0),
            delivery_attempts: Set(0),
            handover_photo_url: Set(None),
            delivery_photo_url: Set(None),
            sender_id_url: Set(request.sender_id_url),
            luggage_photo_url: Set(request.luggage_photo_url),
            status: Set(OrderState::initial().status),
            note: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(&txn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to create order");
            ServiceError::DatabaseError(e)
        })?;

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit purchase");
            ServiceError::DatabaseError(e)
        })?;

        info!(order_id = %order_id, tracking_number = %order.tracking_number, price = %price, "Order placed");
        publish(
            &self.event_sender,
            Event::OrderCreated {
                order_id,
                listing_id: listing.id,
                buyer_id: actor.user_id,
                weight: request.weight,
            },
        )
        .await;

        Ok(order)
    }

    /// Records the sender's documents; issues codes if the order is already paid.
    #[instrument(skip(self, upload), fields(order_id = %order_id, buyer_id = %actor.user_id))]
    pub async fn upload_documents(
        &self,
        actor: &Actor,
        order_id: Uuid,
        upload: DocumentUpload,
    ) -> Result<OrderModel, ServiceError> {
        upload.validate()?;

        let txn = self.db_pool.begin().await?;
        let order = load_order(&txn, order_id).await?;

        if order.buyer_id != actor.user_id {
            return Err(ServiceError::Forbidden(
                "Only the buyer may upload documents for this order".to_string(),
            ));
        }
        let before_handover = matches!(
            order.status,
            OrderStatus::PendingPayment | OrderStatus::PaymentFailed | OrderStatus::PendingHandover
        ) && order.handover_verified_at.is_none();
        if !before_handover {
            return Err(ServiceError::StateConflict(
                "Documents can only be changed before handover".to_string(),
            ));
        }

        let mut changes = no_changes();
        changes.sender_id_url = Set(Some(upload.sender_id_url));
        if let Some(photo) = upload.luggage_photo_url {
            changes.luggage_photo_url = Set(Some(photo));
        }
        let issue = codes_due(&order, order.payment_status, true);
        if issue {
            attach_codes(&mut changes, &self.code_generator());
        }

        let updated = commit_order_changes(&txn, &order, changes).await?;
        txn.commit().await?;

        info!(order_id = %order_id, codes_issued = issue, "Order documents uploaded");
        publish(&self.event_sender, Event::DocumentsUploaded(order_id)).await;
        if issue {
            publish(&self.event_sender, Event::VerificationCodesIssued(order_id)).await;
        }
        Ok(updated)
    }

    /// The full order row, codes and receiver details included, for its buyer or an
    /// administrator. Sellers read orders through [`OrderService::seller_view`].
    #[instrument(skip(self), fields(actor_id = %actor.user_id))]
    pub async fn get_order(&self, actor: &Actor, order_id: Uuid) -> Result<OrderModel, ServiceError> {
        let order = load_order(&*self.db_pool, order_id).await?;
        if order.buyer_id != actor.user_id && !actor.is_admin {
            return Err(ServiceError::Forbidden(
                "Only the buyer may view this order".to_string(),
            ));
        }
        Ok(order)
    }

    #[instrument(skip(self), fields(buyer_id = %actor.user_id))]
    pub async fn list_buyer_orders(&self, actor: &Actor) -> Result<Vec<OrderModel>, ServiceError> {
        let orders = OrderEntity::find()
            .filter(order::Column::BuyerId.eq(actor.user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?;
        Ok(orders)
    }

    /// Orders placed on any of the actor's listings, newest first, as seller views.
    #[instrument(skip(self), fields(seller_id = %actor.user_id))]
    pub async fn list_seller_orders(
        &self,
        actor: &Actor,
    ) -> Result<Vec<SellerOrderView>, ServiceError> {
        let db = &*self.db_pool;
        let rows = OrderEntity::find()
            .find_also_related(listing::Entity)
            .filter(listing::Column::SellerId.eq(actor.user_id))
            .order_by_desc(order::Column::CreatedAt)
            .all(db)
            .await?;

        let buyer_ids: Vec<Uuid> = rows.iter().map(|(order, _)| order.buyer_id).collect();
        let buyers: HashMap<Uuid, UserModel> = UserEntity::find()
            .filter(user::Column::Id.is_in(buyer_ids))
            .all(db)
            .await?
            .into_iter()
            .map(|buyer| (buyer.id, buyer))
            .collect();

        let mut views = Vec::with_capacity(rows.len());
        for (order, listing) in rows {
            let listing = listing.ok_or_else(|| {
                ServiceError::NotFound(format!("Listing {} not found", order.listing_id))
            })?;
            let buyer = buyers.get(&order.buyer_id).ok_or_else(|| {
                ServiceError::NotFound(format!("User {} not found", order.buyer_id))
            })?;
            views.push(self.seller_view_of(&order, &listing, buyer));
        }
        Ok(views)
    }

    /// Audit history, oldest first. Readable by either party and administrators.
    #[instrument(skip(self), fields(actor_id = %actor.user_id))]
    pub async fn order_notes(
        &self,
        actor: &Actor,
        order_id: Uuid,
    ) -> Result<Vec<OrderNoteModel>, ServiceError> {
        let db = &*self.db_pool;
        let order = load_order(db, order_id).await?;
        if order.buyer_id != actor.user_id && !actor.is_admin {
            let listing = load_listing(db, order.listing_id).await?;
            if listing.seller_id != actor.user_id {
                return Err(ServiceError::Forbidden(
                    "Not a party to this order".to_string(),
                ));
            }
        }
        let notes = OrderNoteEntity::find()
            .filter(order_note::Column::OrderId.eq(order_id))
            .order_by_asc(order_note::Column::CreatedAt)
            .all(db)
            .await?;
        Ok(notes)
    }

    /// The buyer's post-payment summary, the one place codes are shown to the buyer.
    #[instrument(skip(self), fields(buyer_id = %actor.user_id))]
    pub async fn buyer_summary(
        &self,
        actor: &Actor,
        order_id: Uuid,
    ) -> Result<BuyerOrderSummary, ServiceError> {
        let db = &*self.db_pool;
        let order = load_order(db, order_id).await?;
        if order.buyer_id != actor.user_id {
            return Err(ServiceError::Forbidden(
                "Only the buyer may view this summary".to_string(),
            ));
        }
        let listing = load_listing(db, order.listing_id).await?;
        let seller = load_user(db, listing.seller_id).await?;

        let codes = (order.is_paid() && order.codes_issued()).then(|| RevealedCodes {
            handover: order.handover_code.clone(),
            delivery: order.delivery_code.clone(),
        });
        let seller_contact = ContactVisibility::for_order(&order).seller_contact(&seller, &listing);

        Ok(BuyerOrderSummary {
            order_id: order.id,
            tracking_number: order.tracking_number.clone(),
            status: order.status,
            payment_status: order.payment_status,
            payment_method: order.payment_method,
            purchased_weight: order.purchased_weight,
            purchase_price: order.purchase_price,
            currency: order.currency.clone(),
            listing: PublicListing::from(&listing),
            documents_required: order.is_paid() && order.sender_id_url.is_none(),
            codes,
            seller_contact,
            handover_verified_at: order.handover_verified_at,
            delivery_verified_at: order.delivery_verified_at,
        })
    }

    /// What the seller needs to run the handover and delivery checks.
    #[instrument(skip(self), fields(seller_id = %actor.user_id))]
    pub async fn seller_view(
        &self,
        actor: &Actor,
        order_id: Uuid,
    ) -> Result<SellerOrderView, ServiceError> {
        let db = &*self.db_pool;
        let order = load_order(db, order_id).await?;
        let listing = load_listing(db, order.listing_id).await?;
        if listing.seller_id != actor.user_id && !actor.is_admin {
            return Err(ServiceError::Forbidden(
                "Only the listing's seller may view this order".to_string(),
            ));
        }
        let buyer = load_user(db, order.buyer_id).await?;
        Ok(self.seller_view_of(&order, &listing, &buyer))
    }

    fn seller_view_of(
        &self,
        order: &OrderModel,
        listing: &ListingModel,
        buyer: &UserModel,
    ) -> SellerOrderView {
        let max = self.verification.max_attempts;
        SellerOrderView {
            order_id: order.id,
            listing_id: listing.id,
            tracking_number: order.tracking_number.clone(),
            status: order.status,
            payment_status: order.payment_status,
            purchased_weight: order.purchased_weight,
            purchase_price: order.purchase_price,
            currency: order.currency.clone(),
            buyer_contact: ContactVisibility::for_order(order).buyer_contact(buyer, order),
            documents_uploaded: order.sender_id_url.is_some(),
            handover_attempts_remaining: remaining_attempts(order, VerificationLeg::Handover, max),
            delivery_attempts_remaining: remaining_attempts(order, VerificationLeg::Delivery, max),
            handover_verified_at: order.handover_verified_at,
            delivery_verified_at: order.delivery_verified_at,
        }
    }
}

pub(crate) async fn load_user<C: ConnectionTrait>(
    conn: &C,
    user_id: Uuid,
) -> Result<UserModel, ServiceError> {
    UserEntity::find_by_id(user_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("User {} not found", user_id)))
}

use crate::{
    auth::Actor,
    db::DbPool,
    entities::user::{
        ActiveModel as UserActiveModel, Entity as UserEntity, Model as UserModel,
        PayoutMethodType,
    },
    errors::ServiceError,
    events::{publish, Event, EventSender},
};
use chrono::{Datelike, Utc};
use sea_orm::{ActiveModelTrait, ActiveValue, EntityTrait, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Local copy of an account that lives at the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateProfileRequest {
    pub id: Uuid,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1, max = 120))]
    pub full_name: Option<String>,
    #[validate(length(min = 6, max = 20))]
    pub phone: Option<String>,
    #[serde(default)]
    pub phone_verified: bool,
    #[serde(default)]
    pub is_admin: bool,
}

/// Where a seller wants to be paid. Exactly one destination at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PayoutDetails {
    None,
    Bank {
        account_name: String,
        bank_name: String,
        routing: Option<String>,
        account_number: String,
    },
    /// Summary of a card on file; the full number never reaches this service.
    Card {
        holder_name: String,
        brand: String,
        last4: String,
        exp_month: i32,
        exp_year: i32,
    },
    MobileBanking {
        number: String,
    },
    #[serde(rename = "payid")]
    PayId {
        identifier: String,
    },
}

impl PayoutDetails {
    pub fn method(&self) -> PayoutMethodType {
        match self {
            PayoutDetails::None => PayoutMethodType::None,
            PayoutDetails::Bank { .. } => PayoutMethodType::Bank,
            PayoutDetails::Card { .. } => PayoutMethodType::Card,
            PayoutDetails::MobileBanking { .. } => PayoutMethodType::MobileBanking,
            PayoutDetails::PayId { .. } => PayoutMethodType::PayId,
        }
    }

    fn validate(&self) -> Result<(), ServiceError> {
        match self {
            PayoutDetails::None => Ok(()),
            PayoutDetails::Bank {
                account_name,
                bank_name,
                account_number,
                ..
            } => {
                require("account_name", account_name)?;
                require("bank_name", bank_name)?;
                require("account_number", account_number)
            }
            PayoutDetails::Card {
                holder_name,
                brand,
                last4,
                exp_month,
                exp_year,
            } => {
                require("holder_name", holder_name)?;
                require("brand", brand)?;
                if last4.len() != 4 || !last4.chars().all(|c| c.is_ascii_digit()) {
                    return Err(ServiceError::invalid("last4", "must be exactly 4 digits"));
                }
                if !(1..=12).contains(exp_month) {
                    return Err(ServiceError::invalid("exp_month", "must be between 1 and 12"));
                }
                if *exp_year < Utc::now().year() {
                    return Err(ServiceError::invalid("exp_year", "card has expired"));
                }
                Ok(())
            }
            PayoutDetails::MobileBanking { number } => require("number", number),
            PayoutDetails::PayId { identifier } => require("identifier", identifier),
        }
    }

    /// Writes every payout column; those outside the chosen variant become NULL.
    fn apply(self, active: &mut UserActiveModel) {
        active.payout_method = Set(self.method());
        active.bank_account_name = Set(None);
        active.bank_name = Set(None);
        active.bank_routing = Set(None);
        active.bank_account_number = Set(None);
        active.card_holder_name = Set(None);
        active.card_brand = Set(None);
        active.card_last4 = Set(None);
        active.card_exp_month = Set(None);
        active.card_exp_year = Set(None);
        active.mobile_banking_number = Set(None);
        active.payid_identifier = Set(None);

        match self {
            PayoutDetails::None => {}
            PayoutDetails::Bank {
                account_name,
                bank_name,
                routing,
                account_number,
            } => {
                active.bank_account_name = Set(Some(account_name.trim().to_string()));
                active.bank_name = Set(Some(bank_name.trim().to_string()));
                active.bank_routing = Set(routing);
                active.bank_account_number = Set(Some(account_number.trim().to_string()));
            }
            PayoutDetails::Card {
                holder_name,
                brand,
                last4,
                exp_month,
                exp_year,
            } => {
                active.card_holder_name = Set(Some(holder_name.trim().to_string()));
                active.card_brand = Set(Some(brand.trim().to_string()));
                active.card_last4 = Set(Some(last4));
                active.card_exp_month = Set(Some(exp_month));
                active.card_exp_year = Set(Some(exp_year));
            }
            PayoutDetails::MobileBanking { number } => {
                active.mobile_banking_number = Set(Some(number.trim().to_string()));
            }
            PayoutDetails::PayId { identifier } => {
                active.payid_identifier = Set(Some(identifier.trim().to_string()));
            }
        }
    }

    /// Rebuilds the union from a stored row.
    pub fn from_user(user: &UserModel) -> Self {
        match user.payout_method {
            PayoutMethodType::None => PayoutDetails::None,
            PayoutMethodType::Bank => PayoutDetails::Bank {
                account_name: user.bank_account_name.clone().unwrap_or_default(),
                bank_name: user.bank_name.clone().unwrap_or_default(),
                routing: user.bank_routing.clone(),
                account_number: user.bank_account_number.clone().unwrap_or_default(),
            },
            PayoutMethodType::Card => PayoutDetails::Card {
                holder_name: user.card_holder_name.clone().unwrap_or_default(),
                brand: user.card_brand.clone().unwrap_or_default(),
                last4: user.card_last4.clone().unwrap_or_default(),
                exp_month: user.card_exp_month.unwrap_or_default(),
                exp_year: user.card_exp_year.unwrap_or_default(),
            },
            PayoutMethodType::MobileBanking => PayoutDetails::MobileBanking {
                number: user.mobile_banking_number.clone().unwrap_or_default(),
            },
            PayoutMethodType::PayId => PayoutDetails::PayId {
                identifier: user.payid_identifier.clone().unwrap_or_default(),
            },
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        Err(ServiceError::invalid(field, "is required"))
    } else {
        Ok(())
    }
}

#[derive(Clone)]
pub struct UserService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl UserService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    #[instrument(skip(self, request), fields(user_id = %request.id))]
    pub async fn create_profile(
        &self,
        request: CreateProfileRequest,
    ) -> Result<UserModel, ServiceError> {
        request.validate()?;

        let now = Utc::now();
        let user = UserActiveModel {
            id: Set(request.id),
            full_name: Set(request.full_name),
            email: Set(request.email.trim().to_lowercase()),
            phone: Set(request.phone),
            phone_verified: Set(request.phone_verified),
            is_admin: Set(request.is_admin),
            is_active: Set(true),
            payout_method: Set(PayoutMethodType::None),
            bank_account_name: Set(None),
            bank_name: Set(None),
            bank_routing: Set(None),
            bank_account_number: Set(None),
            card_holder_name: Set(None),
            card_brand: Set(None),
            card_last4: Set(None),
            card_exp_month: Set(None),
            card_exp_year: Set(None),
            mobile_banking_number: Set(None),
            payid_identifier: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db_pool)
        .await?;

        info!(user_id = %user.id, "User profile created");
        Ok(user)
    }

    #[instrument(skip(self))]
    pub async fn get_profile(&self, user_id: Uuid) -> Result<UserModel, ServiceError> {
        UserEntity::find_by_id(user_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("User {} not found", user_id)))
    }

    #[instrument(skip(self, details), fields(actor_id = %actor.user_id, method = %details.method()))]
    pub async fn update_payout(
        &self,
        actor: &Actor,
        user_id: Uuid,
        details: PayoutDetails,
    ) -> Result<UserModel, ServiceError> {
        actor.require_owner_or_admin(user_id, "account")?;
        details.validate()?;

        let user = self.get_profile(user_id).await?;
        let mut active: UserActiveModel = user.into();
        details.apply(&mut active);
        active.updated_at = ActiveValue::Set(Utc::now());
        let updated = active.update(&*self.db_pool).await?;

        info!(user_id = %user_id, method = %updated.payout_method, "Payout details updated");
        publish(&self.event_sender, Event::PayoutDetailsUpdated(user_id)).await;
        Ok(updated)
    }

    /// Suspends or restores an account. Administrators cannot change their own.
    #[instrument(skip(self), fields(actor_id = %actor.user_id))]
    pub async fn set_active(
        &self,
        actor: &Actor,
        user_id: Uuid,
        active: bool,
    ) -> Result<UserModel, ServiceError> {
        self.change_access(actor, user_id, |changes| changes.is_active = Set(active))
            .await
    }

    /// Grants or revokes administrator rights. Administrators cannot change their own.
    #[instrument(skip(self), fields(actor_id = %actor.user_id))]
    pub async fn set_admin(
        &self,
        actor: &Actor,
        user_id: Uuid,
        admin: bool,
    ) -> Result<UserModel, ServiceError> {
        self.change_access(actor, user_id, |changes| changes.is_admin = Set(admin))
            .await
    }

    async fn change_access(
        &self,
        actor: &Actor,
        user_id: Uuid,
        apply: impl FnOnce(&mut UserActiveModel),
    ) -> Result<UserModel, ServiceError> {
        actor.require_admin()?;
        if actor.user_id == user_id {
            return Err(ServiceError::invalid(
                "user_id",
                "administrators cannot change their own access",
            ));
        }

        let user = self.get_profile(user_id).await?;
        let mut changes: UserActiveModel = user.into();
        apply(&mut changes);
        changes.updated_at = Set(Utc::now());
        let updated = changes.update(&*self.db_pool).await?;

        info!(
            user_id = %user_id,
            is_active = updated.is_active,
            is_admin = updated.is_admin,
            "User access changed"
        );
        publish(
            &self.event_sender,
            Event::UserAccessChanged {
                user_id,
                is_active: updated.is_active,
                is_admin: updated.is_admin,
            },
        )
        .await;
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn payout_details(&self, user_id: Uuid) -> Result<PayoutDetails, ServiceError> {
        let user = self.get_profile(user_id).await?;
        Ok(PayoutDetails::from_user(&user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn card(last4: &str, exp_month: i32) -> PayoutDetails {
        PayoutDetails::Card {
            holder_name: "A Seller".into(),
            brand: "visa".into(),
            last4: last4.into(),
            exp_month,
            exp_year: Utc::now().year() + 2,
        }
    }

    #[test]
    fn card_summary_rules() {
        assert!(card("4242", 12).validate().is_ok());
        assert_matches!(card("424", 1).validate(), Err(ServiceError::ValidationError(_)));
        assert_matches!(card("42a2", 1).validate(), Err(ServiceError::ValidationError(_)));
        assert_matches!(card("4242", 13).validate(), Err(ServiceError::ValidationError(_)));
        assert_matches!(card("4242", 0).validate(), Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn bank_requires_account_number() {
        let details = PayoutDetails::Bank {
            account_name: "A Seller".into(),
            bank_name: "Bank".into(),
            routing: None,
            account_number: "  ".into(),
        };
        assert_matches!(details.validate(), Err(ServiceError::ValidationError(msg)) if msg.starts_with("account_number"));
    }

    #[test]
    fn tagged_json_shape() {
        let json = serde_json::to_value(PayoutDetails::PayId {
            identifier: "seller@example.com".into(),
        })
        .unwrap();
        assert_eq!(json["method"], "payid");
    }
}

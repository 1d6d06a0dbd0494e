//! Who may see whose phone number and email.
//!
//! Visibility is derived from `payment_status` on every read and is never stored.

use serde::{Deserialize, Serialize};

use crate::entities::{
    listing::Model as ListingModel,
    order::{Model as OrderModel, PaymentStatus},
    user::Model as UserModel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactVisibility {
    pub seller_contact_visible_to_buyer: bool,
    pub buyer_contact_visible_to_seller: bool,
}

impl ContactVisibility {
    pub fn for_payment_status(payment_status: PaymentStatus) -> Self {
        let paid = payment_status == PaymentStatus::Paid;
        Self {
            seller_contact_visible_to_buyer: paid,
            buyer_contact_visible_to_seller: paid,
        }
    }

    pub fn for_order(order: &OrderModel) -> Self {
        Self::for_payment_status(order.payment_status)
    }

    /// Seller details for the buyer, or `None` before payment.
    pub fn seller_contact(
        &self,
        seller: &UserModel,
        listing: &ListingModel,
    ) -> Option<SellerContact> {
        self.seller_contact_visible_to_buyer.then(|| SellerContact {
            contact: ContactDetails::from(seller),
            origin_phone: listing.origin_phone.clone(),
            destination_phone: listing.destination_phone.clone(),
        })
    }

    /// Buyer and receiver details for the seller, or `None` before payment.
    pub fn buyer_contact(&self, buyer: &UserModel, order: &OrderModel) -> Option<BuyerContact> {
        self.buyer_contact_visible_to_seller.then(|| BuyerContact {
            contact: ContactDetails::from(buyer),
            receiver: ReceiverDetails::from(order),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDetails {
    pub name: Option<String>,
    pub email: String,
    pub phone: Option<String>,
}

impl From<&UserModel> for ContactDetails {
    fn from(user: &UserModel) -> Self {
        Self {
            name: user.full_name.clone(),
            email: user.email.clone(),
            phone: user.phone.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SellerContact {
    pub contact: ContactDetails,
    pub origin_phone: Option<String>,
    pub destination_phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiverDetails {
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub address: String,
    pub postcode: Option<String>,
    pub country: String,
}

impl From<&OrderModel> for ReceiverDetails {
    fn from(order: &OrderModel) -> Self {
        Self {
            name: order.receiver_name.clone(),
            phone: order.receiver_phone.clone(),
            email: order.receiver_email.clone(),
            address: order.delivery_address.clone(),
            postcode: order.delivery_postcode.clone(),
            country: order.delivery_country.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuyerContact {
    pub contact: ContactDetails,
    pub receiver: ReceiverDetails,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_paid_unlocks_contacts() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::ManualReview,
            PaymentStatus::Failed,
            PaymentStatus::Refunded,
        ] {
            let visibility = ContactVisibility::for_payment_status(status);
            assert!(!visibility.seller_contact_visible_to_buyer, "{status}");
            assert!(!visibility.buyer_contact_visible_to_seller, "{status}");
        }

        let paid = ContactVisibility::for_payment_status(PaymentStatus::Paid);
        assert!(paid.seller_contact_visible_to_buyer);
        assert!(paid.buyer_contact_visible_to_seller);
    }
}

//! Payment capture for both families, refunds, and processor webhooks.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::{settling_gateway, test_config, MockGateway, TestHarness};
use maa_express::{
    auth::Actor,
    config::StripeConfig,
    entities::{
        order::{Model as OrderModel, OrderStatus, PaymentMethod, PaymentStatus, VerificationLeg},
        order_note::NoteKind,
    },
    errors::ServiceError,
    gateways::{
        webhook::sign_payload, GatewayError, GatewayPaymentStatus, GatewayProvider, PaymentIntent,
    },
    services::{
        codes::PENDING_CODE,
        payments::{
            InstantConfirmation, ManualPaymentSubmission, PaymentGateways, PaymentOutcome,
            WebhookDisposition,
        },
        verification::{VerificationOutcome, VerifyCodeRequest},
    },
};
use mockall::{predicate, Sequence};
use rust_decimal_macros::dec;
use serde_json::json;

const WEBHOOK_SECRET: &str = "whsec_test_secret";

fn intent(id: &str) -> PaymentIntent {
    PaymentIntent {
        provider: GatewayProvider::Stripe,
        intent_id: id.to_string(),
        client_secret: Some(format!("{}_secret", id)),
        approval_url: None,
    }
}

fn confirmation(intent_id: &str) -> InstantConfirmation {
    InstantConfirmation {
        intent_id: intent_id.to_string(),
        payer_id: None,
    }
}

fn manual(method: &str, reference: &str, receipt_url: Option<&str>) -> ManualPaymentSubmission {
    ManualPaymentSubmission {
        method: method.to_string(),
        reference: reference.to_string(),
        receipt_url: receipt_url.map(str::to_string),
    }
}

fn stripe(gateway: MockGateway) -> PaymentGateways {
    PaymentGateways::new().with_stripe(Arc::new(gateway))
}

/// Seller, buyer, and a 5 kg order at 10 per kg on a fresh listing.
async fn order_fixture(h: &TestHarness, with_documents: bool) -> (Actor, Actor, OrderModel) {
    let seller = h.seller().await;
    let buyer = h.buyer().await;
    let listing = h.approved_listing(&seller, dec!(10), dec!(20)).await;
    let order = h.purchase(&buyer, listing.id, dec!(5), with_documents).await;
    (seller, buyer, order)
}

#[tokio::test]
async fn failed_instant_payment_can_be_retried() {
    let mut gateway = MockGateway::new();
    let mut seq = Sequence::new();
    gateway
        .expect_create_intent()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(intent("pi_first")));
    gateway
        .expect_verify_payment()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| {
            Ok(GatewayPaymentStatus::Failed {
                reason: "card_declined".to_string(),
            })
        });
    gateway
        .expect_create_intent()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(intent("pi_second")));
    gateway
        .expect_verify_payment()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| {
            Ok(GatewayPaymentStatus::Succeeded {
                transaction_id: "pi_second".to_string(),
                amount_minor: Some(5000),
            })
        });

    let h = TestHarness::with_gateways(stripe(gateway)).await;
    let (_, buyer, order) = order_fixture(&h, true).await;
    let payments = &h.services.payments;

    payments
        .start_instant_payment(&buyer, order.id, "STRIPE")
        .await
        .unwrap();
    let failed = payments
        .confirm_instant_payment(&buyer, order.id, confirmation("pi_first"))
        .await
        .unwrap();
    assert_matches!(failed, PaymentOutcome::Failed { .. });

    let stored = h.services.orders.get_order(&buyer, order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::PaymentFailed);
    assert_eq!(stored.payment_status, PaymentStatus::Failed);
    assert_eq!(stored.handover_code, PENDING_CODE);

    payments
        .start_instant_payment(&buyer, order.id, "stripe")
        .await
        .unwrap();
    let paid = payments
        .confirm_instant_payment(&buyer, order.id, confirmation("pi_second"))
        .await
        .unwrap();
    assert_matches!(paid, PaymentOutcome::Paid { .. });

    let stored = h.services.orders.get_order(&buyer, order.id).await.unwrap();
    assert_eq!(stored.status, OrderStatus::PendingHandover);
    assert_eq!(stored.payment_method, Some(PaymentMethod::Stripe));
    assert_eq!(stored.payment_transaction_id.as_deref(), Some("pi_second"));
    assert!(stored.codes_issued());
}

#[tokio::test]
async fn mismatched_amount_fails_the_payment() {
    let gateway = settling_gateway("pi_short", 4000);
    let h = TestHarness::with_gateways(stripe(gateway)).await;
    let (_, buyer, order) = order_fixture(&h, true).await;

    h.services
        .payments
        .start_instant_payment(&buyer, order.id, "stripe")
        .await
        .unwrap();
    let outcome = h
        .services
        .payments
        .confirm_instant_payment(&buyer, order.id, confirmation("pi_short"))
        .await
        .unwrap();
    assert_matches!(outcome, PaymentOutcome::Failed { reason } if reason.contains("does not match"));

    let stored = h.services.orders.get_order(&buyer, order.id).await.unwrap();
    assert_eq!(stored.payment_status, PaymentStatus::Failed);
    assert!(stored.payment_transaction_id.is_none());
}

#[tokio::test]
async fn processing_and_gateway_errors_leave_the_order_alone() {
    let mut gateway = MockGateway::new();
    gateway
        .expect_create_intent()
        .returning(|_| Ok(intent("pi_slow")));
    let mut seq = Sequence::new();
    gateway
        .expect_verify_payment()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Ok(GatewayPaymentStatus::Processing));
    gateway
        .expect_verify_payment()
        .times(1)
        .in_sequence(&mut seq)
        .returning(|_| Err(GatewayError::Unavailable(503)));

    let h = TestHarness::with_gateways(stripe(gateway)).await;
    let (_, buyer, order) = order_fixture(&h, true).await;
    let payments = &h.services.payments;

    payments
        .start_instant_payment(&buyer, order.id, "stripe")
        .await
        .unwrap();
    let before = h.services.orders.get_order(&buyer, order.id).await.unwrap();

    let pending = payments
        .confirm_instant_payment(&buyer, order.id, confirmation("pi_slow"))
        .await
        .unwrap();
    assert_eq!(pending, PaymentOutcome::Pending);

    let unavailable = payments
        .confirm_instant_payment(&buyer, order.id, confirmation("pi_slow"))
        .await;
    assert_matches!(unavailable, Err(ServiceError::ExternalServiceError(_)));

    let after = h.services.orders.get_order(&buyer, order.id).await.unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.status, OrderStatus::PendingPayment);
    assert_eq!(after.payment_status, PaymentStatus::Pending);
}

#[tokio::test]
async fn method_must_match_its_family() {
    let h = TestHarness::new().await;
    let (_, buyer, order) = order_fixture(&h, false).await;
    let payments = &h.services.payments;

    assert_matches!(
        payments.start_instant_payment(&buyer, order.id, "WISE").await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        payments
            .submit_manual_payment(&buyer, order.id, manual("STRIPE", "ref", None))
            .await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        payments
            .submit_manual_payment(&buyer, order.id, manual("CRYPTO", "ref", None))
            .await,
        Err(ServiceError::ValidationError(_))
    );
    // No processor configured.
    assert_matches!(
        payments.start_instant_payment(&buyer, order.id, "paypal").await,
        Err(ServiceError::ValidationError(msg)) if msg.contains("not available")
    );
    assert_matches!(
        payments
            .submit_manual_payment(&buyer, order.id, manual("WISE", "   ", None))
            .await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn charges_below_the_minimum_are_refused() {
    let gateway = MockGateway::new();
    let h = TestHarness::with_gateways(stripe(gateway)).await;
    let seller = h.seller().await;
    let buyer = h.buyer().await;
    let listing = h.approved_listing(&seller, dec!(0.10), dec!(5)).await;
    let order = h.purchase(&buyer, listing.id, dec!(1), false).await;

    let result = h
        .services
        .payments
        .start_instant_payment(&buyer, order.id, "stripe")
        .await;
    assert_matches!(result, Err(ServiceError::ValidationError(msg)) if msg.contains("at least"));
}

#[tokio::test]
async fn only_the_buyer_pays() {
    let h = TestHarness::new().await;
    let (seller, _, order) = order_fixture(&h, false).await;

    let result = h
        .services
        .payments
        .submit_manual_payment(&seller, order.id, manual("WISE", "ref-1", None))
        .await;
    assert_matches!(result, Err(ServiceError::Forbidden(_)));
}

#[tokio::test]
async fn resubmission_replaces_the_previous_receipt() {
    let h = TestHarness::new().await;
    let (_, buyer, order) = order_fixture(&h, false).await;
    let payments = &h.services.payments;

    payments
        .submit_manual_payment(
            &buyer,
            order.id,
            manual("BANK_ACCOUNT", "first", Some("uploads/first.png")),
        )
        .await
        .unwrap();
    let second = payments
        .submit_manual_payment(&buyer, order.id, manual("MOBILE_BANKING_BKASH_NAGAD", "second", None))
        .await
        .unwrap();

    assert_eq!(second.payment_status, PaymentStatus::ManualReview);
    assert_eq!(second.payment_method, Some(PaymentMethod::MobileBanking));
    assert_eq!(second.payment_reference.as_deref(), Some("second"));
    assert!(second.payment_receipt_url.is_none());
}

#[tokio::test]
async fn rejection_is_noted_and_payment_can_be_resubmitted() {
    let h = TestHarness::new().await;
    let (_, buyer, order) = order_fixture(&h, false).await;
    let admin = h.admin().await;
    let payments = &h.services.payments;

    payments
        .submit_manual_payment(&buyer, order.id, manual("PAYID", "pay-1", None))
        .await
        .unwrap();

    assert_matches!(
        payments.reject_manual_payment(&buyer, order.id, "nope").await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        payments.reject_manual_payment(&admin, order.id, "  ").await,
        Err(ServiceError::ValidationError(_))
    );

    let rejected = payments
        .reject_manual_payment(&admin, order.id, "Transfer not received")
        .await
        .unwrap();
    assert_eq!(rejected.status, OrderStatus::PaymentFailed);
    assert_eq!(rejected.payment_status, PaymentStatus::Failed);
    let note = rejected.note.expect("rejection note");
    assert!(note.contains("[ADMIN REJECTION - "));
    assert!(note.ends_with("Transfer not received"));

    let notes = h.services.orders.order_notes(&buyer, order.id).await.unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind, NoteKind::PaymentRejection);
    assert_eq!(notes[0].author_id, admin.user_id);

    assert_matches!(
        payments.approve_manual_payment(&admin, order.id).await,
        Err(ServiceError::StateConflict(_))
    );

    let resubmitted = payments
        .submit_manual_payment(&buyer, order.id, manual("PAYID", "pay-2", None))
        .await
        .unwrap();
    assert_eq!(resubmitted.status, OrderStatus::PendingPayment);
    assert_eq!(resubmitted.payment_status, PaymentStatus::ManualReview);
}

#[tokio::test]
async fn paid_orders_take_no_further_payment() {
    let h = TestHarness::new().await;
    let (_, buyer, order) = order_fixture(&h, true).await;
    let admin = h.admin().await;
    let payments = &h.services.payments;

    payments
        .submit_manual_payment(&buyer, order.id, manual("WISE", "w-1", None))
        .await
        .unwrap();
    assert_matches!(
        payments.approve_manual_payment(&buyer, order.id).await,
        Err(ServiceError::Forbidden(_))
    );
    payments.approve_manual_payment(&admin, order.id).await.unwrap();

    assert_matches!(
        payments
            .submit_manual_payment(&buyer, order.id, manual("WISE", "w-2", None))
            .await,
        Err(ServiceError::StateConflict(msg)) if msg.contains("already been paid")
    );
    assert_matches!(
        payments.approve_manual_payment(&admin, order.id).await,
        Err(ServiceError::StateConflict(_))
    );
    assert_matches!(
        payments.refund_payment(&admin, order.id, None).await,
        Err(ServiceError::StateConflict(_))
    );
}

#[tokio::test]
async fn disputed_card_payment_is_refunded_through_the_processor() {
    let mut gateway = settling_gateway("pi_refund", 5000);
    gateway
        .expect_refund()
        .with(predicate::function(|r: &maa_express::gateways::RefundRequest| {
            r.transaction_id == "pi_refund" && r.amount_minor.is_none()
        }))
        .times(1)
        .returning(|_| Ok("re_123".to_string()));

    let h = TestHarness::with_gateways(stripe(gateway)).await;
    let (seller, buyer, order) = order_fixture(&h, true).await;
    let admin = h.admin().await;

    h.services
        .payments
        .start_instant_payment(&buyer, order.id, "stripe")
        .await
        .unwrap();
    h.services
        .payments
        .confirm_instant_payment(&buyer, order.id, confirmation("pi_refund"))
        .await
        .unwrap();

    let mut last = None;
    for _ in 0..h.config.verification.max_attempts {
        last = Some(
            h.services
                .verification
                .verify(
                    &seller,
                    order.id,
                    VerificationLeg::Handover,
                    VerifyCodeRequest {
                        code: "########".to_string(),
                        photo_url: None,
                    },
                )
                .await
                .unwrap(),
        );
    }
    assert_eq!(last, Some(VerificationOutcome::Disputed));

    let refunded = h
        .services
        .payments
        .refund_payment(&admin, order.id, None)
        .await
        .unwrap();
    assert_eq!(refunded.payment_status, PaymentStatus::Refunded);

    let notes = h.services.orders.order_notes(&buyer, order.id).await.unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].kind, NoteKind::Refund);
    assert!(notes[0].body.contains("re_123"));
    assert_eq!(h.remaining_weight(refunded.listing_id).await, dec!(20));
}

async fn webhook_harness(gateway: MockGateway) -> TestHarness {
    let mut config = test_config();
    let mut stripe_config = StripeConfig::new("sk_test_123");
    stripe_config.webhook_secret = Some(WEBHOOK_SECRET.to_string());
    config.payments.stripe = Some(stripe_config);
    TestHarness::with(config, stripe(gateway)).await
}

fn signed(payload: &[u8], timestamp: i64) -> String {
    let signature = sign_payload(WEBHOOK_SECRET, timestamp, payload).unwrap();
    format!("t={},v1={}", timestamp, signature)
}

fn succeeded_event(intent_id: &str, amount: i64) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": "evt_1",
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": intent_id, "amount_received": amount } }
    }))
    .unwrap()
}

#[tokio::test]
async fn webhook_settles_a_started_payment_once() {
    let mut gateway = MockGateway::new();
    gateway
        .expect_create_intent()
        .returning(|_| Ok(intent("pi_hook")));
    let h = webhook_harness(gateway).await;
    let (_, buyer, order) = order_fixture(&h, true).await;
    let payments = &h.services.payments;

    payments
        .start_instant_payment(&buyer, order.id, "stripe")
        .await
        .unwrap();

    let now = 1_700_000_000;
    let payload = succeeded_event("pi_hook", 5000);
    let applied = payments
        .handle_stripe_webhook(&payload, &signed(&payload, now), now)
        .await
        .unwrap();
    assert_eq!(
        applied,
        WebhookDisposition::Applied {
            order_id: order.id,
            outcome: PaymentOutcome::Paid {
                transaction_id: "pi_hook".to_string()
            }
        }
    );

    let stored = h.services.orders.get_order(&buyer, order.id).await.unwrap();
    assert_eq!(stored.payment_status, PaymentStatus::Paid);
    assert!(stored.codes_issued());

    let replay = payments
        .handle_stripe_webhook(&payload, &signed(&payload, now), now)
        .await
        .unwrap();
    assert_matches!(replay, WebhookDisposition::Ignored { .. });
    let unchanged = h.services.orders.get_order(&buyer, order.id).await.unwrap();
    assert_eq!(unchanged.version, stored.version);
    assert_eq!(unchanged.handover_code, stored.handover_code);
}

#[tokio::test]
async fn webhook_authentication() {
    let h = webhook_harness(MockGateway::new()).await;
    let payments = &h.services.payments;
    let now = 1_700_000_000;
    let payload = succeeded_event("pi_unknown", 100);

    let tampered = succeeded_event("pi_unknown", 999_999);
    assert_matches!(
        payments
            .handle_stripe_webhook(&tampered, &signed(&payload, now), now)
            .await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        payments
            .handle_stripe_webhook(&payload, &signed(&payload, now - 3_600), now)
            .await,
        Err(ServiceError::Forbidden(_))
    );
    assert_matches!(
        payments.handle_stripe_webhook(&payload, "garbage", now).await,
        Err(ServiceError::ValidationError(_))
    );

    let unknown = payments
        .handle_stripe_webhook(&payload, &signed(&payload, now), now)
        .await
        .unwrap();
    assert_matches!(unknown, WebhookDisposition::Ignored { reason } if reason.contains("pi_unknown"));
}

//! Billing webhook verification and plan enforcement.
//!
//! Billing events arrive from Razorpay signed with hex-encoded HMAC-SHA256
//! of the raw request body (`X-Razorpay-Signature`). Verified events update
//! the subscription record; the plan tier caps how many workflows may be
//! protected at once.

use chrono::{DateTime, Duration, Utc};
use ring::hmac;
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::storage::{Plan, SqliteStorage, Subscription};

/// Header carrying the webhook signature.
pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";

/// Trial length from first activity.
pub const TRIAL_DAYS: i64 = 21;

/// Verify a billing webhook signature against the raw body.
pub fn verify_signature(secret: &str, signature_hex: &str, body: &[u8]) -> Result<()> {
    let expected_bytes = hex::decode(signature_hex)
        .map_err(|_| Error::Validation("Invalid signature hex encoding".to_string()))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let computed = hmac::sign(&key, body);

    // Constant-time comparison
    if computed.as_ref().ct_eq(&expected_bytes).unwrap_u8() != 1 {
        return Err(Error::Validation("Invalid webhook signature".to_string()));
    }

    Ok(())
}

/// Parsed billing webhook payload.
#[derive(Debug, Clone, Deserialize)]
pub struct BillingEvent {
    pub event: String,
    pub payload: BillingPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingPayload {
    pub subscription: SubscriptionPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPayload {
    pub id: String,
    /// Account the subscription belongs to
    pub actor: String,
    #[serde(default)]
    pub plan: Option<Plan>,
}

/// Apply a verified billing event to the subscription record.
pub async fn apply_event(storage: &SqliteStorage, event: &BillingEvent) -> Result<Subscription> {
    let payload = &event.payload.subscription;
    let existing = storage.get_subscription(&payload.actor).await?;

    let subscription = match event.event.as_str() {
        "subscription.activated" => Subscription {
            id: payload.id.clone(),
            actor: payload.actor.clone(),
            plan: payload.plan.unwrap_or(Plan::Starter),
            status: "active".to_string(),
            trial_ends_at: None,
            updated_at: Utc::now(),
        },
        "subscription.cancelled" => {
            let mut subscription = existing.ok_or_else(|| {
                Error::NotFound(format!("No subscription for actor {}", payload.actor))
            })?;
            subscription.status = "cancelled".to_string();
            subscription.updated_at = Utc::now();
            subscription
        }
        "subscription.charged" => {
            let mut subscription = existing.ok_or_else(|| {
                Error::NotFound(format!("No subscription for actor {}", payload.actor))
            })?;
            subscription.status = "active".to_string();
            subscription.updated_at = Utc::now();
            subscription
        }
        other => {
            return Err(Error::Validation(format!(
                "Unsupported billing event: {}",
                other
            )))
        }
    };

    storage.upsert_subscription(&subscription).await?;
    storage
        .record_audit(
            "billing",
            &event.event,
            "subscription",
            Some(&subscription.id),
            serde_json::json!({
                "actor": subscription.actor,
                "plan": subscription.plan.to_string(),
                "status": subscription.status,
            }),
        )
        .await?;

    Ok(subscription)
}

/// Protected-workflow cap per plan; `None` is unlimited.
pub fn protected_workflow_cap(plan: Plan) -> Option<u32> {
    match plan {
        Plan::Trial => Some(10),
        Plan::Starter => Some(25),
        Plan::Pro => None,
    }
}

/// Check whether one more workflow may be protected under the current
/// subscription.
///
/// Accounts with no subscription record are on an implicit trial that
/// started now; a stored trial with a past `trial_ends_at` is expired.
pub fn enforce_protection_limit(
    subscription: Option<&Subscription>,
    protected_count: u32,
    now: DateTime<Utc>,
) -> Result<()> {
    let plan = match subscription {
        Some(sub) => {
            if sub.status == "cancelled" {
                return Err(Error::PlanLimit(
                    "Subscription is cancelled; reactivate to protect workflows".to_string(),
                ));
            }
            if sub.plan == Plan::Trial {
                if let Some(ends_at) = sub.trial_ends_at {
                    if now > ends_at {
                        return Err(Error::PlanLimit(format!(
                            "Trial expired on {}; upgrade to keep protecting workflows",
                            ends_at.to_rfc3339()
                        )));
                    }
                }
            }
            sub.plan
        }
        None => Plan::Trial,
    };

    if let Some(cap) = protected_workflow_cap(plan) {
        if protected_count >= cap {
            return Err(Error::PlanLimit(format!(
                "Plan {} allows at most {} protected workflows",
                plan, cap
            )));
        }
    }

    Ok(())
}

/// Load the actor's subscription, starting the trial clock on first use.
///
/// Accounts with no billing history get a [`default_trial`] persisted, so
/// `trial_ends_at` is fixed from their first protect onward.
pub async fn get_or_start_trial(
    storage: &SqliteStorage,
    actor: &str,
    now: DateTime<Utc>,
) -> Result<Subscription> {
    if let Some(existing) = storage.get_subscription(actor).await? {
        return Ok(existing);
    }
    let trial = default_trial(actor, now);
    storage.upsert_subscription(&trial).await?;
    Ok(trial)
}

/// Default trial subscription for an account with no billing history.
pub fn default_trial(actor: &str, now: DateTime<Utc>) -> Subscription {
    Subscription {
        id: uuid::Uuid::new_v4().to_string(),
        actor: actor.to_string(),
        plan: Plan::Trial,
        status: "active".to_string(),
        trial_ends_at: Some(now + Duration::days(TRIAL_DAYS)),
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        hex::encode(hmac::sign(&key, body).as_ref())
    }

    #[test]
    fn test_valid_signature_accepted() {
        let body = br#"{"event":"subscription.activated"}"#;
        let signature = sign("secret", body);
        assert!(verify_signature("secret", &signature, body).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let signature = sign("secret", b"original");
        let err = verify_signature("secret", &signature, b"tampered").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let body = b"payload";
        let signature = sign("secret", body);
        assert!(verify_signature("other", &signature, body).is_err());
    }

    #[test]
    fn test_garbage_signature_rejected() {
        assert!(verify_signature("secret", "not-hex!", b"payload").is_err());
    }

    #[tokio::test]
    async fn test_activation_then_cancellation() {
        let storage = SqliteStorage::open_in_memory().unwrap();

        let activated: BillingEvent = serde_json::from_str(
            r#"{
                "event": "subscription.activated",
                "payload": {"subscription": {"id": "sub_1", "actor": "alice", "plan": "pro"}}
            }"#,
        )
        .unwrap();
        let subscription = apply_event(&storage, &activated).await.unwrap();
        assert_eq!(subscription.plan, Plan::Pro);
        assert_eq!(subscription.status, "active");

        let cancelled: BillingEvent = serde_json::from_str(
            r#"{
                "event": "subscription.cancelled",
                "payload": {"subscription": {"id": "sub_1", "actor": "alice"}}
            }"#,
        )
        .unwrap();
        let subscription = apply_event(&storage, &cancelled).await.unwrap();
        assert_eq!(subscription.status, "cancelled");
        // Plan tier survives cancellation
        assert_eq!(subscription.plan, Plan::Pro);

        let audits = storage.list_audit_logs(10, 0).await.unwrap();
        assert_eq!(audits.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_event_rejected() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let event: BillingEvent = serde_json::from_str(
            r#"{
                "event": "payment.captured",
                "payload": {"subscription": {"id": "sub_1", "actor": "alice"}}
            }"#,
        )
        .unwrap();
        let err = apply_event(&storage, &event).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_plan_caps() {
        let now = Utc::now();

        // Implicit trial caps at 10
        assert!(enforce_protection_limit(None, 9, now).is_ok());
        let err = enforce_protection_limit(None, 10, now).unwrap_err();
        assert_eq!(err.code(), "PLAN_LIMIT");

        // Starter caps at 25
        let starter = Subscription {
            id: "sub".to_string(),
            actor: "alice".to_string(),
            plan: Plan::Starter,
            status: "active".to_string(),
            trial_ends_at: None,
            updated_at: now,
        };
        assert!(enforce_protection_limit(Some(&starter), 24, now).is_ok());
        assert!(enforce_protection_limit(Some(&starter), 25, now).is_err());

        // Pro is unlimited
        let pro = Subscription {
            plan: Plan::Pro,
            ..starter.clone()
        };
        assert!(enforce_protection_limit(Some(&pro), 10_000, now).is_ok());
    }

    #[test]
    fn test_expired_trial_is_blocked() {
        let now = Utc::now();
        let expired = Subscription {
            id: "sub".to_string(),
            actor: "alice".to_string(),
            plan: Plan::Trial,
            status: "active".to_string(),
            trial_ends_at: Some(now - Duration::days(1)),
            updated_at: now,
        };
        let err = enforce_protection_limit(Some(&expired), 0, now).unwrap_err();
        assert_eq!(err.code(), "PLAN_LIMIT");
    }

    #[test]
    fn test_cancelled_subscription_is_blocked() {
        let now = Utc::now();
        let cancelled = Subscription {
            id: "sub".to_string(),
            actor: "alice".to_string(),
            plan: Plan::Pro,
            status: "cancelled".to_string(),
            trial_ends_at: None,
            updated_at: now,
        };
        assert!(enforce_protection_limit(Some(&cancelled), 0, now).is_err());
    }

    #[tokio::test]
    async fn test_first_use_starts_trial_clock() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let now = Utc::now();

        let trial = get_or_start_trial(&storage, "alice", now).await.unwrap();
        assert_eq!(trial.plan, Plan::Trial);
        assert_eq!(trial.trial_ends_at, Some(now + Duration::days(TRIAL_DAYS)));

        // A later call returns the stored subscription, not a fresh trial
        let again = get_or_start_trial(&storage, "alice", now + Duration::days(5))
            .await
            .unwrap();
        assert_eq!(again.id, trial.id);
        assert_eq!(again.trial_ends_at, trial.trial_ends_at);
    }

    #[test]
    fn test_default_trial_window() {
        let now = Utc::now();
        let trial = default_trial("alice", now);
        assert_eq!(trial.plan, Plan::Trial);
        assert_eq!(trial.trial_ends_at, Some(now + Duration::days(TRIAL_DAYS)));
    }
}

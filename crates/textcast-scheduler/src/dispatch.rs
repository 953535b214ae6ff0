//! Message dispatcher: resolves a claimed row to a recipient and text, sends
//! it through the SMS transport, and records the result.

use std::sync::Arc;

use chrono::Utc;
use textcast_channels::{SmsTransport, normalize_phone};
use textcast_core::error::Result;

use crate::message::{Actor, DeliveryStatus, FailureReason, MessageRef};
use crate::persistence::MessageDb;

/// What happened to one dispatched row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    Failed(FailureReason),
    /// The row was no longer `pending` (cancelled or reported meanwhile).
    Skipped,
}

/// Delivers claimed rows.
pub struct Dispatcher {
    db: Arc<MessageDb>,
    transport: Arc<dyn SmsTransport>,
    default_country_code: String,
}

impl Dispatcher {
    pub fn new(db: Arc<MessageDb>, transport: Arc<dyn SmsTransport>, default_country_code: &str) -> Self {
        Self {
            db,
            transport,
            default_country_code: default_country_code.to_string(),
        }
    }

    /// Deliver one claimed row. Only `Err` for store failures; delivery
    /// problems are recorded on the row and reported as the outcome.
    pub async fn dispatch(&self, r: &MessageRef) -> Result<DispatchOutcome> {
        let target = self.db.dispatch_target(r)?;
        if target.status != DeliveryStatus::Pending {
            tracing::debug!("Skipping {r}: now {}", target.status);
            return Ok(DispatchOutcome::Skipped);
        }

        let Some(text) = target.text.filter(|t| !t.trim().is_empty()) else {
            return self.fail(r, FailureReason::Validation, "message content not found");
        };
        let phone = match target.phone.as_deref() {
            Some(raw) => match normalize_phone(raw, &self.default_country_code) {
                Ok(p) => p,
                Err(e) => return self.fail(r, FailureReason::Validation, &e.to_string()),
            },
            None => return self.fail(r, FailureReason::Validation, "recipient phone not found"),
        };

        match self.transport.send(&phone, &text).await {
            Ok(receipt) => {
                self.db.mark_sent(&Actor::System, r, Utc::now(), receipt.provider_id)?;
                tracing::info!("✅ Sent {r} via {}", self.transport.name());
                Ok(DispatchOutcome::Sent)
            }
            Err(e) => {
                tracing::warn!("⚠️ {} send failed for {r}: {e}", self.transport.name());
                self.fail(r, FailureReason::Transport, &e.to_string())
            }
        }
    }

    fn fail(&self, r: &MessageRef, reason: FailureReason, error: &str) -> Result<DispatchOutcome> {
        self.db.mark_failed(&Actor::System, r, reason, error, Utc::now())?;
        Ok(DispatchOutcome::Failed(reason))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::message::StudySource;
    use crate::persistence::ClaimOptions;
    use crate::message::MessageKind;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex;
    use textcast_channels::SmsReceipt;
    use textcast_core::error::TextcastError;

    /// Records sends; fails every send when `fail` is set.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub sent: Mutex<Vec<(String, String)>>,
        pub fail: bool,
    }

    #[async_trait]
    impl SmsTransport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, to: &str, body: &str) -> Result<SmsReceipt> {
            if self.fail {
                return Err(TextcastError::Transport("carrier unavailable".into()));
            }
            self.sent.lock().unwrap().push((to.to_string(), body.to_string()));
            Ok(SmsReceipt { provider_id: Some("SM123".into()) })
        }
    }

    fn claim_all(db: &MessageDb) -> Vec<MessageRef> {
        let opts = ClaimOptions {
            batch_size: 50,
            claim_timeout: Duration::minutes(15),
            kinds: vec![MessageKind::Scheduled, MessageKind::Study],
        };
        db.claim_due(Utc::now(), &opts).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_sends_and_records() {
        let db = Arc::new(MessageDb::open_in_memory().unwrap());
        let c = db.add_contact("u1", "Ana", "(555) 000-0001").unwrap();
        let m = db
            .schedule_message("u1", &c.id, "Hello", Utc::now() - Duration::minutes(1), None, None)
            .unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(db.clone(), transport.clone(), "1");

        let refs = claim_all(&db);
        assert_eq!(dispatcher.dispatch(&refs[0]).await.unwrap(), DispatchOutcome::Sent);
        assert_eq!(
            transport.sent.lock().unwrap().as_slice(),
            &[("+15550000001".to_string(), "Hello".to_string())]
        );
        let d = db.get_scheduled(&m.id).unwrap().unwrap().delivery;
        assert_eq!(d.status, DeliveryStatus::Sent);
        assert_eq!(d.attempts, 1);
        assert_eq!(d.external_id.as_deref(), Some("SM123"));

        // a second dispatch of the same row is a no-op
        assert_eq!(dispatcher.dispatch(&refs[0]).await.unwrap(), DispatchOutcome::Skipped);
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_is_retryable_failure() {
        let db = Arc::new(MessageDb::open_in_memory().unwrap());
        let c = db.add_contact("u1", "Ana", "+15550000001").unwrap();
        db.schedule_message("u1", &c.id, "Hello", Utc::now() - Duration::minutes(1), None, None)
            .unwrap();
        let transport = Arc::new(RecordingTransport { fail: true, ..Default::default() });
        let dispatcher = Dispatcher::new(db.clone(), transport, "1");

        let r = claim_all(&db).remove(0);
        assert_eq!(
            dispatcher.dispatch(&r).await.unwrap(),
            DispatchOutcome::Failed(FailureReason::Transport)
        );
        let d = db.get_delivery(&r).unwrap().unwrap();
        assert_eq!(d.status, DeliveryStatus::Failed);
        assert_eq!(d.attempts, 1);
        assert!(d.error.unwrap().contains("carrier unavailable"));
    }

    #[tokio::test]
    async fn test_bad_phone_is_validation_failure() {
        let db = Arc::new(MessageDb::open_in_memory().unwrap());
        let c = db.add_contact("u1", "Ana", "12").unwrap();
        db.schedule_message("u1", &c.id, "Hello", Utc::now() - Duration::minutes(1), None, None)
            .unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(db.clone(), transport.clone(), "1");

        let r = claim_all(&db).remove(0);
        assert_eq!(
            dispatcher.dispatch(&r).await.unwrap(),
            DispatchOutcome::Failed(FailureReason::Validation)
        );
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_study_message_goes_to_owner_phone() {
        let db = Arc::new(MessageDb::open_in_memory().unwrap());
        db.upsert_owner("u1", "Ana", Some("+15550000009")).unwrap();
        let lesson = db.add_lesson("Week 1").unwrap();
        let cm = db.add_custom_message("u1", &lesson, "Memorize verse 3").unwrap();
        db.select_study_message(
            "u1",
            &lesson,
            StudySource::Custom(cm),
            Some(Utc::now() - Duration::minutes(1)),
        )
        .unwrap();
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(db.clone(), transport.clone(), "1");

        let r = claim_all(&db).remove(0);
        assert_eq!(r.kind, MessageKind::Study);
        assert_eq!(dispatcher.dispatch(&r).await.unwrap(), DispatchOutcome::Sent);
        assert_eq!(transport.sent.lock().unwrap()[0].0, "+15550000009");
    }
}

//! SAR / EIAR application workflow
//!
//! ```text
//! Draft -> Submitted -> UnderReview -> Approved | Rejected
//!                       UnderReview -> PaymentPending -> Completed
//!                                      PaymentPending -> UnderReview (payment failed)
//! ```
//!
//! Every transition is a compare-and-set on the stored status, so two racing
//! requests cannot both move the same application.

use std::sync::Arc;

use nitp_shared::{
    ApplicantType, Application, ApplicationDocument, ApplicationStatus, ApplicationType,
    PaymentPurpose,
};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::fees::{ApplicationFee, FeeSchedule};
use crate::payments::{generate_reference, PaymentCheckout, PaymentInitiator};
use crate::store::{BillingStore, LedgerTx, NewApplication, NewTransaction};
use crate::subscriptions::SubscriptionLedger;

/// Input for a new Draft application
#[derive(Debug, Clone, Deserialize)]
pub struct CreateApplication {
    pub application_type: ApplicationType,
    pub applicant_type: ApplicantType,
    pub title: String,
    pub site_address: String,
}

/// `NITP-<year>-<serial>` with the serial zero-padded to six digits
pub fn format_certificate_number(year: i32, serial: i64) -> String {
    format!("NITP-{}-{:06}", year, serial)
}

/// Settle a successful application payment inside the caller's unit of work.
///
/// UnderReview becomes Approved and PaymentPending becomes Completed; both
/// receive the next certificate number for the current year.
pub(crate) async fn settle_application_payment(
    tx: &mut dyn LedgerTx,
    application_id: Uuid,
    transaction_id: Uuid,
    certificate_base_url: &str,
    now: OffsetDateTime,
) -> BillingResult<Application> {
    let application = tx
        .lock_application(application_id)
        .await?
        .ok_or_else(|| BillingError::SettlementRejected {
            transaction_id,
            reason: format!("application {} does not exist", application_id),
        })?;

    let next = match application.status {
        ApplicationStatus::UnderReview => ApplicationStatus::Approved,
        ApplicationStatus::PaymentPending => ApplicationStatus::Completed,
        other => {
            return Err(BillingError::SettlementRejected {
                transaction_id,
                reason: format!("application {} is {}", application_id, other),
            })
        }
    };

    tx.set_application_status(application_id, next).await?;

    let serial = tx.next_certificate_serial(now.year()).await?;
    let number = format_certificate_number(now.year(), serial);
    let url = format!("{}/{}", certificate_base_url.trim_end_matches('/'), number);
    tx.set_certificate(application_id, &number, &url).await?;

    tracing::info!(
        application_id = %application_id,
        status = %next,
        certificate_number = %number,
        "Application payment settled"
    );

    Ok(Application {
        status: next,
        certificate_number: Some(number),
        certificate_url: Some(url),
        ..application
    })
}

/// Return a PaymentPending application to UnderReview after a failed payment
pub(crate) async fn release_failed_payment(
    tx: &mut dyn LedgerTx,
    application_id: Uuid,
) -> BillingResult<()> {
    if let Some(application) = tx.lock_application(application_id).await? {
        if application.status == ApplicationStatus::PaymentPending {
            tx.set_application_status(application_id, ApplicationStatus::UnderReview)
                .await?;
            tracing::info!(application_id = %application_id, "Application returned to review after failed payment");
        }
    }
    Ok(())
}

fn non_empty(field: &str, value: &str) -> BillingResult<()> {
    if value.trim().is_empty() {
        return Err(BillingError::InvalidInput(format!("{} is required", field)));
    }
    Ok(())
}

#[derive(Clone)]
pub struct ApplicationWorkflow {
    store: Arc<dyn BillingStore>,
    subscriptions: SubscriptionLedger,
    payments: PaymentInitiator,
    fees: FeeSchedule,
}

impl ApplicationWorkflow {
    pub fn new(
        store: Arc<dyn BillingStore>,
        subscriptions: SubscriptionLedger,
        payments: PaymentInitiator,
        fees: FeeSchedule,
    ) -> Self {
        Self {
            store,
            subscriptions,
            payments,
            fees,
        }
    }

    pub fn fee_schedule(&self) -> &FeeSchedule {
        &self.fees
    }

    pub fn calculate_application_fee(
        &self,
        application_type: ApplicationType,
        applicant_type: ApplicantType,
    ) -> BillingResult<ApplicationFee> {
        self.fees
            .calculate_application_fee(application_type, applicant_type)
    }

    async fn load(&self, application_id: Uuid) -> BillingResult<Application> {
        self.store
            .get_application(application_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Application {}", application_id)))
    }

    async fn load_owned(&self, application_id: Uuid, member_id: Uuid) -> BillingResult<Application> {
        let application = self.load(application_id).await?;
        if application.member_id != member_id {
            return Err(BillingError::Forbidden(
                "Application belongs to another member".to_string(),
            ));
        }
        Ok(application)
    }

    /// CAS `from -> to`; a lost race reports the status that won
    async fn transition(
        &self,
        application_id: Uuid,
        from: ApplicationStatus,
        to: ApplicationStatus,
        rejection_reason: Option<&str>,
    ) -> BillingResult<Application> {
        if let Some(updated) = self
            .store
            .transition_application(application_id, from, to, rejection_reason)
            .await?
        {
            tracing::info!(
                application_id = %application_id,
                from = %from,
                to = %to,
                "Application status changed"
            );
            return Ok(updated);
        }

        let current = self.load(application_id).await?;
        Err(BillingError::InvalidState {
            current: current.status,
            expected: from.as_str(),
        })
    }

    /// New Draft; the fee is fixed here. Requires an active subscription.
    pub async fn create(
        &self,
        member_id: Uuid,
        input: CreateApplication,
    ) -> BillingResult<Application> {
        self.subscriptions.require_active(member_id).await?;
        non_empty("title", &input.title)?;
        non_empty("site_address", &input.site_address)?;

        let fee = self
            .fees
            .calculate_application_fee(input.application_type, input.applicant_type)?;

        let application = self
            .store
            .insert_application(NewApplication {
                member_id,
                application_type: input.application_type,
                applicant_type: input.applicant_type,
                title: input.title.trim().to_string(),
                site_address: input.site_address.trim().to_string(),
                amount: fee.total,
            })
            .await?;

        tracing::info!(
            application_id = %application.id,
            member_id = %member_id,
            application_type = %application.application_type,
            amount = application.amount,
            "Application created"
        );
        Ok(application)
    }

    /// Attach a document reference. Requires an active subscription.
    pub async fn add_document(
        &self,
        application_id: Uuid,
        member_id: Uuid,
        doc_type: &str,
        url: &str,
    ) -> BillingResult<ApplicationDocument> {
        self.subscriptions.require_active(member_id).await?;
        non_empty("doc_type", doc_type)?;
        non_empty("url", url)?;

        let application = self.load_owned(application_id, member_id).await?;
        if application.status.is_terminal() {
            return Err(BillingError::InvalidState {
                current: application.status,
                expected: "a non-final status",
            });
        }

        self.store
            .add_document(application_id, doc_type.trim(), url.trim())
            .await
    }

    pub async fn submit(&self, application_id: Uuid, member_id: Uuid) -> BillingResult<Application> {
        let application = self.load_owned(application_id, member_id).await?;
        if application.status != ApplicationStatus::Draft {
            return Err(BillingError::InvalidState {
                current: application.status,
                expected: ApplicationStatus::Draft.as_str(),
            });
        }
        self.transition(
            application_id,
            ApplicationStatus::Draft,
            ApplicationStatus::Submitted,
            None,
        )
        .await
    }

    /// Admin: Submitted -> UnderReview
    pub async fn begin_review(&self, application_id: Uuid) -> BillingResult<Application> {
        self.transition(
            application_id,
            ApplicationStatus::Submitted,
            ApplicationStatus::UnderReview,
            None,
        )
        .await
    }

    /// Admin: UnderReview -> Rejected
    pub async fn reject(&self, application_id: Uuid, reason: &str) -> BillingResult<Application> {
        non_empty("reason", reason)?;
        self.transition(
            application_id,
            ApplicationStatus::UnderReview,
            ApplicationStatus::Rejected,
            Some(reason.trim()),
        )
        .await
    }

    /// Open a checkout for the application fee and move to PaymentPending.
    ///
    /// All guards run before the gateway is contacted. The status is checked
    /// again under lock when the Pending transaction is recorded.
    pub async fn pay_for_application(
        &self,
        application_id: Uuid,
        member_id: Uuid,
        email: &str,
    ) -> BillingResult<PaymentCheckout> {
        self.subscriptions.require_active(member_id).await?;
        let application = self.load_owned(application_id, member_id).await?;
        if application.status != ApplicationStatus::UnderReview {
            return Err(BillingError::InvalidState {
                current: application.status,
                expected: ApplicationStatus::UnderReview.as_str(),
            });
        }

        let purpose = PaymentPurpose::Application { application_id };
        let reference = generate_reference();
        let session = self
            .payments
            .initiate_payment(email, application.amount, &reference, &purpose)
            .await?;

        let mut tx = self.store.begin().await?;
        let locked = tx
            .lock_application(application_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Application {}", application_id)))?;
        if locked.status != ApplicationStatus::UnderReview {
            tracing::warn!(
                application_id = %application_id,
                reference = %reference,
                status = %locked.status,
                "Application changed during checkout; gateway session abandoned"
            );
            return Err(BillingError::InvalidState {
                current: locked.status,
                expected: ApplicationStatus::UnderReview.as_str(),
            });
        }

        tx.insert_transaction(NewTransaction {
            member_id,
            reference: reference.clone(),
            amount: locked.amount,
            purpose,
        })
        .await?;
        tx.set_application_status(application_id, ApplicationStatus::PaymentPending)
            .await?;
        tx.commit().await?;

        tracing::info!(
            application_id = %application_id,
            member_id = %member_id,
            reference = %reference,
            amount = locked.amount,
            "Application payment initiated"
        );

        Ok(PaymentCheckout::from_session(session, locked.amount))
    }

    /// Requires an active subscription
    pub async fn list_for_member(&self, member_id: Uuid) -> BillingResult<Vec<Application>> {
        self.subscriptions.require_active(member_id).await?;
        self.store.list_applications(member_id).await
    }

    pub async fn get_for_member(
        &self,
        application_id: Uuid,
        member_id: Uuid,
    ) -> BillingResult<Application> {
        self.load_owned(application_id, member_id).await
    }

    pub async fn get(&self, application_id: Uuid) -> BillingResult<Application> {
        self.load(application_id).await
    }

    pub async fn list_by_status(
        &self,
        status: ApplicationStatus,
    ) -> BillingResult<Vec<Application>> {
        self.store.list_applications_by_status(status).await
    }

    pub async fn documents(&self, application_id: Uuid) -> BillingResult<Vec<ApplicationDocument>> {
        self.store.list_documents(application_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::FakeGateway;
    use nitp_shared::{MemberType, MembershipGrade};
    use time::Duration;

    struct Fixture {
        store: MemoryStore,
        gateway: Arc<FakeGateway>,
        workflow: ApplicationWorkflow,
        member_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let gateway = Arc::new(FakeGateway::new());
        let dyn_store: Arc<dyn BillingStore> = Arc::new(store.clone());
        let payments = PaymentInitiator::new(dyn_store.clone(), gateway.clone());
        let subscriptions = SubscriptionLedger::new(dyn_store.clone(), payments.clone());
        let workflow =
            ApplicationWorkflow::new(dyn_store, subscriptions, payments, FeeSchedule::standard());

        let member = store
            .seed_member(MemberType::Individual, MembershipGrade::Professional)
            .await;
        let now = OffsetDateTime::now_utc();
        store
            .seed_subscription(member.id, now - Duration::days(10), now + Duration::days(355))
            .await;

        Fixture {
            store,
            gateway,
            workflow,
            member_id: member.id,
        }
    }

    fn sar_individual() -> CreateApplication {
        CreateApplication {
            application_type: ApplicationType::Sar,
            applicant_type: ApplicantType::Individual,
            title: "Mixed-use development, Plot 12".to_string(),
            site_address: "12 Marina Road, Lagos".to_string(),
        }
    }

    #[test]
    fn test_certificate_number_format() {
        assert_eq!(format_certificate_number(2026, 7), "NITP-2026-000007");
        assert_eq!(format_certificate_number(2026, 123_456), "NITP-2026-123456");
    }

    #[tokio::test]
    async fn test_create_fixes_fee_on_draft() {
        let f = fixture().await;
        let application = f.workflow.create(f.member_id, sar_individual()).await.unwrap();
        assert_eq!(application.status, ApplicationStatus::Draft);
        assert_eq!(application.amount, 30_200);
    }

    #[tokio::test]
    async fn test_submit_by_other_member_is_forbidden() {
        let f = fixture().await;
        let application = f.workflow.create(f.member_id, sar_individual()).await.unwrap();

        let err = f
            .workflow
            .submit(application.id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Forbidden(_)));
        let unchanged = f.workflow.get(application.id).await.unwrap();
        assert_eq!(unchanged.status, ApplicationStatus::Draft);
    }

    #[tokio::test]
    async fn test_submit_twice_is_invalid_state() {
        let f = fixture().await;
        let application = f.workflow.create(f.member_id, sar_individual()).await.unwrap();
        let submitted = f.workflow.submit(application.id, f.member_id).await.unwrap();
        assert!(submitted.submitted_at.is_some());

        let err = f.workflow.submit(application.id, f.member_id).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::InvalidState {
                current: ApplicationStatus::Submitted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_reject_requires_under_review() {
        let f = fixture().await;
        let application = f.workflow.create(f.member_id, sar_individual()).await.unwrap();
        f.workflow.submit(application.id, f.member_id).await.unwrap();

        let err = f.workflow.reject(application.id, "Incomplete survey").await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidState { .. }));

        f.workflow.begin_review(application.id).await.unwrap();
        let rejected = f.workflow.reject(application.id, "Incomplete survey").await.unwrap();
        assert_eq!(rejected.status, ApplicationStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("Incomplete survey"));
    }

    #[tokio::test]
    async fn test_documents_refused_after_final_status() {
        let f = fixture().await;
        let application = f.workflow.create(f.member_id, sar_individual()).await.unwrap();
        f.workflow
            .add_document(application.id, f.member_id, "site_plan", "https://files.example/a.pdf")
            .await
            .unwrap();
        f.store
            .set_application_status(application.id, ApplicationStatus::Rejected)
            .await;

        let err = f
            .workflow
            .add_document(application.id, f.member_id, "survey", "https://files.example/b.pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidState { .. }));
        assert_eq!(f.workflow.documents(application.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pay_rejected_by_gateway_leaves_status() {
        let f = fixture().await;
        let application = f.workflow.create(f.member_id, sar_individual()).await.unwrap();
        f.store
            .set_application_status(application.id, ApplicationStatus::UnderReview)
            .await;
        f.gateway.reject_initialize(true);

        let err = f
            .workflow
            .pay_for_application(application.id, f.member_id, "ada@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Gateway(_)));
        assert_eq!(
            f.workflow.get(application.id).await.unwrap().status,
            ApplicationStatus::UnderReview
        );
        assert_eq!(f.store.transaction_count().await, 0);
    }

    #[tokio::test]
    async fn test_settlement_assigns_sequential_certificates() {
        let f = fixture().await;
        let first = f.workflow.create(f.member_id, sar_individual()).await.unwrap();
        let second = f.workflow.create(f.member_id, sar_individual()).await.unwrap();
        f.store
            .set_application_status(first.id, ApplicationStatus::UnderReview)
            .await;
        f.store
            .set_application_status(second.id, ApplicationStatus::PaymentPending)
            .await;

        let now = OffsetDateTime::now_utc();
        let mut tx = f.store.begin().await.unwrap();
        let a = settle_application_payment(tx.as_mut(), first.id, Uuid::new_v4(), "https://c.example/", now)
            .await
            .unwrap();
        let b = settle_application_payment(tx.as_mut(), second.id, Uuid::new_v4(), "https://c.example/", now)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(a.status, ApplicationStatus::Approved);
        assert_eq!(b.status, ApplicationStatus::Completed);
        assert_eq!(
            a.certificate_number,
            Some(format_certificate_number(now.year(), 1))
        );
        assert_eq!(
            b.certificate_number,
            Some(format_certificate_number(now.year(), 2))
        );
        assert_eq!(
            b.certificate_url,
            Some(format!("https://c.example/{}", format_certificate_number(now.year(), 2)))
        );
    }

    #[tokio::test]
    async fn test_settlement_of_draft_is_rejected() {
        let f = fixture().await;
        let application = f.workflow.create(f.member_id, sar_individual()).await.unwrap();

        let mut tx = f.store.begin().await.unwrap();
        let err = settle_application_payment(
            tx.as_mut(),
            application.id,
            Uuid::new_v4(),
            "https://c.example",
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap_err();
        drop(tx);

        assert!(matches!(err, BillingError::SettlementRejected { .. }));
        assert_eq!(
            f.workflow.get(application.id).await.unwrap().status,
            ApplicationStatus::Draft
        );
    }
}

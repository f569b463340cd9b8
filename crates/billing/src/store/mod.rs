//! Storage seam for the billing core
//!
//! [`BillingStore`] covers single-statement reads and writes.
//! [`LedgerTx`] is a unit of work: everything done through one instance
//! commits or rolls back together, and the `lock_*` methods hold row locks
//! until then. Dropping a `LedgerTx` without committing rolls it back.
//!
//! Never call a [`BillingStore`] method while holding a [`LedgerTx`] from the
//! same store: the in-memory backend serialises on a single lock.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use nitp_shared::{
    ApplicantType, Application, ApplicationDocument, ApplicationStatus, ApplicationType, Member,
    MemberProfile, MemberStatus, MemberType, MembershipGrade, PaymentPurpose, Subscription, Tool,
    ToolUsage, Transaction, TransactionStatus,
};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

pub use memory::MemoryStore;
pub use postgres::PgBillingStore;

#[derive(Debug, Clone)]
pub struct NewMember {
    pub identity_id: Uuid,
    pub membership_id: String,
    pub member_type: MemberType,
    pub grade: MembershipGrade,
    pub profile: MemberProfile,
}

#[derive(Debug, Clone)]
pub struct NewApplication {
    pub member_id: Uuid,
    pub application_type: ApplicationType,
    pub applicant_type: ApplicantType,
    pub title: String,
    pub site_address: String,
    pub amount: i64,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub member_id: Uuid,
    pub reference: String,
    pub amount: i64,
    pub purpose: PaymentPurpose,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub member_id: Uuid,
    pub grade: MembershipGrade,
    pub amount: i64,
    pub start_date: OffsetDateTime,
    pub end_date: OffsetDateTime,
    pub transaction_id: Uuid,
}

/// Result of an atomic conditional debit
#[derive(Debug, Clone, PartialEq)]
pub enum DebitOutcome {
    Debited { usage: ToolUsage, balance: i64 },
    Insufficient { balance: i64 },
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Start a unit of work
    async fn begin(&self) -> BillingResult<Box<dyn LedgerTx>>;

    // Members
    async fn create_member(&self, new: NewMember) -> BillingResult<Member>;
    async fn get_member(&self, member_id: Uuid) -> BillingResult<Option<Member>>;
    async fn get_member_by_identity(&self, identity_id: Uuid) -> BillingResult<Option<Member>>;
    async fn update_profile(
        &self,
        member_id: Uuid,
        profile: &MemberProfile,
    ) -> BillingResult<Option<Member>>;
    /// Move Active members without a period covering `now` to Expired
    async fn expire_lapsed_members(&self, now: OffsetDateTime) -> BillingResult<Vec<Uuid>>;

    // Subscriptions
    async fn subscription_covering(
        &self,
        member_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>>;
    async fn list_subscriptions(&self, member_id: Uuid) -> BillingResult<Vec<Subscription>>;

    // Credits
    /// Atomic increment, returns the new balance
    async fn increment_credits(&self, member_id: Uuid, amount: i64) -> BillingResult<i64>;
    /// Atomic check-and-decrement plus usage record
    async fn debit_credits(
        &self,
        member_id: Uuid,
        tool_id: Uuid,
        cost: i64,
    ) -> BillingResult<DebitOutcome>;
    async fn get_tool(&self, tool_id: Uuid) -> BillingResult<Option<Tool>>;
    async fn list_tools(&self) -> BillingResult<Vec<Tool>>;

    // Applications
    async fn insert_application(&self, new: NewApplication) -> BillingResult<Application>;
    async fn get_application(&self, id: Uuid) -> BillingResult<Option<Application>>;
    async fn list_applications(&self, member_id: Uuid) -> BillingResult<Vec<Application>>;
    async fn list_applications_by_status(
        &self,
        status: ApplicationStatus,
    ) -> BillingResult<Vec<Application>>;
    /// Compare-and-set on status; `None` when the current status was not `from`
    async fn transition_application(
        &self,
        id: Uuid,
        from: ApplicationStatus,
        to: ApplicationStatus,
        rejection_reason: Option<&str>,
    ) -> BillingResult<Option<Application>>;
    async fn add_document(
        &self,
        application_id: Uuid,
        doc_type: &str,
        url: &str,
    ) -> BillingResult<ApplicationDocument>;
    async fn list_documents(&self, application_id: Uuid)
        -> BillingResult<Vec<ApplicationDocument>>;

    // Transactions
    /// Fails with `DuplicateReference` if the reference already exists
    async fn insert_transaction(&self, new: NewTransaction) -> BillingResult<Transaction>;
    async fn get_transaction(&self, reference: &str) -> BillingResult<Option<Transaction>>;
    async fn pending_transactions_before(
        &self,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Transaction>>;
    /// Leaves the status untouched
    async fn record_reconciliation_error(&self, reference: &str, message: &str)
        -> BillingResult<()>;
}

#[async_trait]
pub trait LedgerTx: Send {
    async fn lock_transaction(&mut self, reference: &str) -> BillingResult<Option<Transaction>>;
    async fn insert_transaction(&mut self, new: NewTransaction) -> BillingResult<Transaction>;
    /// Final status plus the raw verify payload; clears `last_error`
    async fn settle_transaction(
        &mut self,
        id: Uuid,
        status: TransactionStatus,
        gateway_response: Option<&serde_json::Value>,
    ) -> BillingResult<()>;

    async fn lock_member(&mut self, member_id: Uuid) -> BillingResult<Option<Member>>;
    async fn set_member_status(&mut self, member_id: Uuid, status: MemberStatus)
        -> BillingResult<()>;
    async fn increment_credits(&mut self, member_id: Uuid, amount: i64) -> BillingResult<i64>;

    /// Latest `end_date` of any period for the member
    async fn latest_period_end(&mut self, member_id: Uuid)
        -> BillingResult<Option<OffsetDateTime>>;
    async fn insert_subscription(&mut self, new: NewSubscription) -> BillingResult<Subscription>;

    async fn lock_application(&mut self, id: Uuid) -> BillingResult<Option<Application>>;
    async fn set_application_status(
        &mut self,
        id: Uuid,
        status: ApplicationStatus,
    ) -> BillingResult<()>;
    /// Next serial in the per-year certificate sequence, starting at 1
    async fn next_certificate_serial(&mut self, year: i32) -> BillingResult<i64>;
    async fn set_certificate(&mut self, id: Uuid, number: &str, url: &str) -> BillingResult<()>;

    async fn commit(self: Box<Self>) -> BillingResult<()>;
}

//! PostgreSQL billing store
//!
//! Enums are stored as TEXT and parsed on the way out, so a row that does
//! not decode surfaces as `BillingError::Internal` instead of a panic.

use async_trait::async_trait;
use nitp_shared::{
    Application, ApplicationDocument, ApplicationStatus, Member, MemberProfile, MemberStatus,
    PaymentPurpose, Subscription, Tool, ToolUsage, Transaction, TransactionStatus,
};
use sqlx::{PgPool, Postgres};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BillingStore, DebitOutcome, LedgerTx, NewApplication, NewMember, NewSubscription,
    NewTransaction,
};
use crate::error::{BillingError, BillingResult};

const MEMBER_COLUMNS: &str = "id, identity_id, membership_id, member_type, grade, status, credits, \
     full_name, phone, state_of_residence, institution, qualification, graduation_year, \
     employer, specialization, created_at, updated_at";

const SUBSCRIPTION_COLUMNS: &str =
    "id, member_id, grade, amount, start_date, end_date, transaction_id, created_at";

const APPLICATION_COLUMNS: &str = "id, member_id, application_type, applicant_type, title, \
     site_address, status, amount, certificate_number, certificate_url, rejection_reason, \
     submitted_at, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, member_id, reference, tx_type, amount, status, metadata, \
     gateway_response, last_error, created_at, updated_at, settled_at";

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct MemberRow {
    id: Uuid,
    identity_id: Uuid,
    membership_id: String,
    member_type: String,
    grade: String,
    status: String,
    credits: i64,
    full_name: String,
    phone: Option<String>,
    state_of_residence: Option<String>,
    institution: Option<String>,
    qualification: Option<String>,
    graduation_year: Option<i32>,
    employer: Option<String>,
    specialization: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<MemberRow> for Member {
    type Error = BillingError;

    fn try_from(row: MemberRow) -> Result<Self, Self::Error> {
        Ok(Member {
            id: row.id,
            identity_id: row.identity_id,
            membership_id: row.membership_id,
            member_type: row.member_type.parse()?,
            grade: row.grade.parse()?,
            status: row.status.parse()?,
            credits: row.credits,
            profile: MemberProfile {
                full_name: row.full_name,
                phone: row.phone,
                state_of_residence: row.state_of_residence,
                institution: row.institution,
                qualification: row.qualification,
                graduation_year: row.graduation_year,
                employer: row.employer,
                specialization: row.specialization,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    member_id: Uuid,
    grade: String,
    amount: i64,
    start_date: OffsetDateTime,
    end_date: OffsetDateTime,
    transaction_id: Uuid,
    created_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            member_id: row.member_id,
            grade: row.grade.parse()?,
            amount: row.amount,
            start_date: row.start_date,
            end_date: row.end_date,
            transaction_id: row.transaction_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ApplicationRow {
    id: Uuid,
    member_id: Uuid,
    application_type: String,
    applicant_type: String,
    title: String,
    site_address: String,
    status: String,
    amount: i64,
    certificate_number: Option<String>,
    certificate_url: Option<String>,
    rejection_reason: Option<String>,
    submitted_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<ApplicationRow> for Application {
    type Error = BillingError;

    fn try_from(row: ApplicationRow) -> Result<Self, Self::Error> {
        Ok(Application {
            id: row.id,
            member_id: row.member_id,
            application_type: row.application_type.parse()?,
            applicant_type: row.applicant_type.parse()?,
            title: row.title,
            site_address: row.site_address,
            status: row.status.parse()?,
            amount: row.amount,
            certificate_number: row.certificate_number,
            certificate_url: row.certificate_url,
            rejection_reason: row.rejection_reason,
            submitted_at: row.submitted_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DocumentRow {
    id: Uuid,
    application_id: Uuid,
    doc_type: String,
    url: String,
    uploaded_at: OffsetDateTime,
}

impl From<DocumentRow> for ApplicationDocument {
    fn from(row: DocumentRow) -> Self {
        ApplicationDocument {
            id: row.id,
            application_id: row.application_id,
            doc_type: row.doc_type,
            url: row.url,
            uploaded_at: row.uploaded_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: Uuid,
    member_id: Uuid,
    reference: String,
    tx_type: String,
    amount: i64,
    status: String,
    metadata: serde_json::Value,
    gateway_response: Option<serde_json::Value>,
    last_error: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    settled_at: Option<OffsetDateTime>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(Transaction {
            id: row.id,
            member_id: row.member_id,
            reference: row.reference,
            tx_type: row.tx_type.parse()?,
            amount: row.amount,
            status: row.status.parse()?,
            purpose: PaymentPurpose::from_json(&row.metadata),
            gateway_response: row.gateway_response,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            settled_at: row.settled_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ToolRow {
    id: Uuid,
    slug: String,
    name: String,
    credit_cost: i64,
    is_active: bool,
}

impl From<ToolRow> for Tool {
    fn from(row: ToolRow) -> Self {
        Tool {
            id: row.id,
            slug: row.slug,
            name: row.name,
            credit_cost: row.credit_cost,
            is_active: row.is_active,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ToolUsageRow {
    id: Uuid,
    member_id: Uuid,
    tool_id: Uuid,
    credits_used: i64,
    used_at: OffsetDateTime,
}

impl From<ToolUsageRow> for ToolUsage {
    fn from(row: ToolUsageRow) -> Self {
        ToolUsage {
            id: row.id,
            member_id: row.member_id,
            tool_id: row.tool_id,
            credits_used: row.credits_used,
            used_at: row.used_at,
        }
    }
}

fn collect<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Map a unique-violation on the reference key to `DuplicateReference`
fn map_insert_error(err: sqlx::Error, reference: &str) -> BillingError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return BillingError::DuplicateReference(reference.to_string());
        }
    }
    err.into()
}

const MEMBERSHIP_ID_CONSTRAINT: &str = "members_membership_id_key";

/// Map a unique-violation on the membership id to `DuplicateMembershipId`;
/// other conflicts (one member per identity) stay database errors
fn map_member_insert_error(err: sqlx::Error, membership_id: &str) -> BillingError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") && db.constraint() == Some(MEMBERSHIP_ID_CONSTRAINT)
        {
            return BillingError::DuplicateMembershipId(membership_id.to_string());
        }
    }
    err.into()
}

// =============================================================================
// Store
// =============================================================================

/// PostgreSQL-backed [`BillingStore`]
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn begin(&self) -> BillingResult<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn create_member(&self, new: NewMember) -> BillingResult<Member> {
        let row: MemberRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO members (
                identity_id, membership_id, member_type, grade, full_name, phone,
                state_of_residence, institution, qualification, graduation_year,
                employer, specialization
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {MEMBER_COLUMNS}
            "#
        ))
        .bind(new.identity_id)
        .bind(&new.membership_id)
        .bind(new.member_type.as_str())
        .bind(new.grade.as_str())
        .bind(&new.profile.full_name)
        .bind(&new.profile.phone)
        .bind(&new.profile.state_of_residence)
        .bind(&new.profile.institution)
        .bind(&new.profile.qualification)
        .bind(new.profile.graduation_year)
        .bind(&new.profile.employer)
        .bind(&new.profile.specialization)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_member_insert_error(e, &new.membership_id))?;

        row.try_into()
    }

    async fn get_member(&self, member_id: Uuid) -> BillingResult<Option<Member>> {
        let row: Option<MemberRow> =
            sqlx::query_as(&format!("SELECT {MEMBER_COLUMNS} FROM members WHERE id = $1"))
                .bind(member_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(Member::try_from).transpose()
    }

    async fn get_member_by_identity(&self, identity_id: Uuid) -> BillingResult<Option<Member>> {
        let row: Option<MemberRow> = sqlx::query_as(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members WHERE identity_id = $1"
        ))
        .bind(identity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Member::try_from).transpose()
    }

    async fn update_profile(
        &self,
        member_id: Uuid,
        profile: &MemberProfile,
    ) -> BillingResult<Option<Member>> {
        let row: Option<MemberRow> = sqlx::query_as(&format!(
            r#"
            UPDATE members
            SET full_name = $2, phone = $3, state_of_residence = $4, institution = $5,
                qualification = $6, graduation_year = $7, employer = $8,
                specialization = $9, updated_at = NOW()
            WHERE id = $1
            RETURNING {MEMBER_COLUMNS}
            "#
        ))
        .bind(member_id)
        .bind(&profile.full_name)
        .bind(&profile.phone)
        .bind(&profile.state_of_residence)
        .bind(&profile.institution)
        .bind(&profile.qualification)
        .bind(profile.graduation_year)
        .bind(&profile.employer)
        .bind(&profile.specialization)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Member::try_from).transpose()
    }

    async fn expire_lapsed_members(&self, now: OffsetDateTime) -> BillingResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE members m
            SET status = 'expired', updated_at = $1
            WHERE m.status = 'active'
              AND NOT EXISTS (
                  SELECT 1 FROM subscriptions s
                  WHERE s.member_id = m.id
                    AND s.start_date <= $1
                    AND s.end_date > $1
              )
            RETURNING m.id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn subscription_covering(
        &self,
        member_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE member_id = $1 AND start_date <= $2 AND end_date > $2
            ORDER BY start_date DESC
            LIMIT 1
            "#
        ))
        .bind(member_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Subscription::try_from).transpose()
    }

    async fn list_subscriptions(&self, member_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE member_id = $1 ORDER BY start_date DESC"
        ))
        .bind(member_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn increment_credits(&self, member_id: Uuid, amount: i64) -> BillingResult<i64> {
        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE members SET credits = credits + $2, updated_at = NOW() WHERE id = $1 RETURNING credits",
        )
        .bind(member_id)
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;
        balance.ok_or_else(|| BillingError::NotFound(format!("Member {}", member_id)))
    }

    async fn debit_credits(
        &self,
        member_id: Uuid,
        tool_id: Uuid,
        cost: i64,
    ) -> BillingResult<DebitOutcome> {
        let mut tx = self.pool.begin().await?;

        // Conditional decrement: a concurrent debit either sees the new
        // balance or fails the predicate, never both pass on the old one
        let balance: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE members
            SET credits = credits - $2, updated_at = NOW()
            WHERE id = $1 AND credits >= $2
            RETURNING credits
            "#,
        )
        .bind(member_id)
        .bind(cost)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(balance) = balance else {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT credits FROM members WHERE id = $1")
                    .bind(member_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            return match current {
                Some(balance) => Ok(DebitOutcome::Insufficient { balance }),
                None => Err(BillingError::NotFound(format!("Member {}", member_id))),
            };
        };

        let usage: ToolUsageRow = sqlx::query_as(
            r#"
            INSERT INTO tool_usages (member_id, tool_id, credits_used)
            VALUES ($1, $2, $3)
            RETURNING id, member_id, tool_id, credits_used, used_at
            "#,
        )
        .bind(member_id)
        .bind(tool_id)
        .bind(cost)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(DebitOutcome::Debited {
            usage: usage.into(),
            balance,
        })
    }

    async fn get_tool(&self, tool_id: Uuid) -> BillingResult<Option<Tool>> {
        let row: Option<ToolRow> = sqlx::query_as(
            "SELECT id, slug, name, credit_cost, is_active FROM tools WHERE id = $1",
        )
        .bind(tool_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Tool::from))
    }

    async fn list_tools(&self) -> BillingResult<Vec<Tool>> {
        let rows: Vec<ToolRow> = sqlx::query_as(
            "SELECT id, slug, name, credit_cost, is_active FROM tools WHERE is_active ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Tool::from).collect())
    }

    async fn insert_application(&self, new: NewApplication) -> BillingResult<Application> {
        let row: ApplicationRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO applications (
                member_id, application_type, applicant_type, title, site_address, status, amount
            )
            VALUES ($1, $2, $3, $4, $5, 'draft', $6)
            RETURNING {APPLICATION_COLUMNS}
            "#
        ))
        .bind(new.member_id)
        .bind(new.application_type.as_str())
        .bind(new.applicant_type.as_str())
        .bind(&new.title)
        .bind(&new.site_address)
        .bind(new.amount)
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn get_application(&self, id: Uuid) -> BillingResult<Option<Application>> {
        let row: Option<ApplicationRow> = sqlx::query_as(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Application::try_from).transpose()
    }

    async fn list_applications(&self, member_id: Uuid) -> BillingResult<Vec<Application>> {
        let rows: Vec<ApplicationRow> = sqlx::query_as(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications WHERE member_id = $1 ORDER BY created_at DESC"
        ))
        .bind(member_id)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn list_applications_by_status(
        &self,
        status: ApplicationStatus,
    ) -> BillingResult<Vec<Application>> {
        let rows: Vec<ApplicationRow> = sqlx::query_as(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications WHERE status = $1 ORDER BY created_at"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn transition_application(
        &self,
        id: Uuid,
        from: ApplicationStatus,
        to: ApplicationStatus,
        rejection_reason: Option<&str>,
    ) -> BillingResult<Option<Application>> {
        let row: Option<ApplicationRow> = sqlx::query_as(&format!(
            r#"
            UPDATE applications
            SET status = $3,
                rejection_reason = COALESCE($4, rejection_reason),
                submitted_at = CASE WHEN $3 = 'submitted' THEN NOW() ELSE submitted_at END,
                updated_at = NOW()
            WHERE id = $1 AND status = $2
            RETURNING {APPLICATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(rejection_reason)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Application::try_from).transpose()
    }

    async fn add_document(
        &self,
        application_id: Uuid,
        doc_type: &str,
        url: &str,
    ) -> BillingResult<ApplicationDocument> {
        let row: DocumentRow = sqlx::query_as(
            r#"
            INSERT INTO application_documents (application_id, doc_type, url)
            VALUES ($1, $2, $3)
            RETURNING id, application_id, doc_type, url, uploaded_at
            "#,
        )
        .bind(application_id)
        .bind(doc_type)
        .bind(url)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn list_documents(
        &self,
        application_id: Uuid,
    ) -> BillingResult<Vec<ApplicationDocument>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            r#"
            SELECT id, application_id, doc_type, url, uploaded_at
            FROM application_documents
            WHERE application_id = $1
            ORDER BY uploaded_at
            "#,
        )
        .bind(application_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ApplicationDocument::from).collect())
    }

    async fn insert_transaction(&self, new: NewTransaction) -> BillingResult<Transaction> {
        insert_transaction(&self.pool, new).await
    }

    async fn get_transaction(&self, reference: &str) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE reference = $1"
        ))
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Transaction::try_from).transpose()
    }

    async fn pending_transactions_before(
        &self,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Transaction>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM transactions
            WHERE status = 'pending' AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        collect(rows)
    }

    async fn record_reconciliation_error(
        &self,
        reference: &str,
        message: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE transactions SET last_error = $2, updated_at = NOW() WHERE reference = $1",
        )
        .bind(reference)
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn insert_transaction<'e, E>(executor: E, new: NewTransaction) -> BillingResult<Transaction>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let row: TransactionRow = sqlx::query_as(&format!(
        r#"
        INSERT INTO transactions (member_id, reference, tx_type, amount, status, metadata)
        VALUES ($1, $2, $3, $4, 'pending', $5)
        RETURNING {TRANSACTION_COLUMNS}
        "#
    ))
    .bind(new.member_id)
    .bind(&new.reference)
    .bind(new.purpose.transaction_type().as_str())
    .bind(new.amount)
    .bind(new.purpose.to_json())
    .fetch_one(executor)
    .await
    .map_err(|e| map_insert_error(e, &new.reference))?;
    row.try_into()
}

// =============================================================================
// Unit of work
// =============================================================================

struct PgLedgerTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn lock_transaction(&mut self, reference: &str) -> BillingResult<Option<Transaction>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE reference = $1 FOR UPDATE"
        ))
        .bind(reference)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Transaction::try_from).transpose()
    }

    async fn insert_transaction(&mut self, new: NewTransaction) -> BillingResult<Transaction> {
        insert_transaction(&mut *self.tx, new).await
    }

    async fn settle_transaction(
        &mut self,
        id: Uuid,
        status: TransactionStatus,
        gateway_response: Option<&serde_json::Value>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $2, gateway_response = $3, last_error = NULL,
                settled_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(gateway_response)
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("Transaction {}", id)));
        }
        Ok(())
    }

    async fn lock_member(&mut self, member_id: Uuid) -> BillingResult<Option<Member>> {
        let row: Option<MemberRow> = sqlx::query_as(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members WHERE id = $1 FOR UPDATE"
        ))
        .bind(member_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Member::try_from).transpose()
    }

    async fn set_member_status(
        &mut self,
        member_id: Uuid,
        status: MemberStatus,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE members SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(member_id)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn increment_credits(&mut self, member_id: Uuid, amount: i64) -> BillingResult<i64> {
        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE members SET credits = credits + $2, updated_at = NOW() WHERE id = $1 RETURNING credits",
        )
        .bind(member_id)
        .bind(amount)
        .fetch_optional(&mut *self.tx)
        .await?;
        balance.ok_or_else(|| BillingError::NotFound(format!("Member {}", member_id)))
    }

    async fn latest_period_end(
        &mut self,
        member_id: Uuid,
    ) -> BillingResult<Option<OffsetDateTime>> {
        let end: Option<OffsetDateTime> =
            sqlx::query_scalar("SELECT MAX(end_date) FROM subscriptions WHERE member_id = $1")
                .bind(member_id)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(end)
    }

    async fn insert_subscription(&mut self, new: NewSubscription) -> BillingResult<Subscription> {
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions (member_id, grade, amount, start_date, end_date, transaction_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(new.member_id)
        .bind(new.grade.as_str())
        .bind(new.amount)
        .bind(new.start_date)
        .bind(new.end_date)
        .bind(new.transaction_id)
        .fetch_one(&mut *self.tx)
        .await?;
        row.try_into()
    }

    async fn lock_application(&mut self, id: Uuid) -> BillingResult<Option<Application>> {
        let row: Option<ApplicationRow> = sqlx::query_as(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(Application::try_from).transpose()
    }

    async fn set_application_status(
        &mut self,
        id: Uuid,
        status: ApplicationStatus,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE applications SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn next_certificate_serial(&mut self, year: i32) -> BillingResult<i64> {
        let serial: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO certificate_counters (year, last_serial)
            VALUES ($1, 1)
            ON CONFLICT (year) DO UPDATE SET last_serial = certificate_counters.last_serial + 1
            RETURNING last_serial
            "#,
        )
        .bind(year)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(serial)
    }

    async fn set_certificate(&mut self, id: Uuid, number: &str, url: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE applications
            SET certificate_number = $2, certificate_url = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(number)
        .bind(url)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

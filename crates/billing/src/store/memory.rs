//! In-memory billing store
//!
//! Backs tests and local demos. A unit of work takes the single state lock
//! for its whole lifetime and edits a copy, so concurrent callers observe
//! the same serialisation a row lock gives them in PostgreSQL.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use nitp_shared::{
    Application, ApplicationDocument, ApplicationStatus, Member, MemberProfile, MemberStatus,
    MemberType, MembershipGrade, Subscription, Tool, ToolUsage, Transaction, TransactionStatus,
};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{
    BillingStore, DebitOutcome, LedgerTx, NewApplication, NewMember, NewSubscription,
    NewTransaction,
};
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    members: HashMap<Uuid, Member>,
    subscriptions: Vec<Subscription>,
    applications: HashMap<Uuid, Application>,
    documents: Vec<ApplicationDocument>,
    transactions: HashMap<String, Transaction>,
    tools: HashMap<Uuid, Tool>,
    tool_usages: Vec<ToolUsage>,
    certificate_counters: HashMap<i32, i64>,
}

impl MemoryState {
    fn member_mut(&mut self, member_id: Uuid) -> BillingResult<&mut Member> {
        self.members
            .get_mut(&member_id)
            .ok_or_else(|| BillingError::NotFound(format!("Member {}", member_id)))
    }

    fn application_mut(&mut self, id: Uuid) -> BillingResult<&mut Application> {
        self.applications
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("Application {}", id)))
    }

    fn add_credits(&mut self, member_id: Uuid, amount: i64) -> BillingResult<i64> {
        let member = self.member_mut(member_id)?;
        member.credits += amount;
        member.updated_at = OffsetDateTime::now_utc();
        Ok(member.credits)
    }

    fn insert_transaction(&mut self, new: NewTransaction) -> BillingResult<Transaction> {
        if self.transactions.contains_key(&new.reference) {
            return Err(BillingError::DuplicateReference(new.reference));
        }
        let now = OffsetDateTime::now_utc();
        let tx = Transaction {
            id: Uuid::new_v4(),
            member_id: new.member_id,
            reference: new.reference.clone(),
            tx_type: new.purpose.transaction_type(),
            amount: new.amount,
            status: TransactionStatus::Pending,
            purpose: new.purpose,
            gateway_response: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            settled_at: None,
        };
        self.transactions.insert(new.reference, tx.clone());
        Ok(tx)
    }

    fn covering(&self, member_id: Uuid, at: OffsetDateTime) -> Option<&Subscription> {
        self.subscriptions
            .iter()
            .filter(|s| s.member_id == member_id && s.covers(at))
            .max_by_key(|s| s.start_date)
    }
}

/// In-memory [`BillingStore`]
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a Pending member with a zero balance
    pub async fn seed_member(&self, member_type: MemberType, grade: MembershipGrade) -> Member {
        let now = OffsetDateTime::now_utc();
        let member = Member {
            id: Uuid::new_v4(),
            identity_id: Uuid::new_v4(),
            membership_id: nitp_shared::generate_membership_id(),
            member_type,
            grade,
            status: MemberStatus::Pending,
            credits: 0,
            profile: MemberProfile {
                full_name: "Test Member".to_string(),
                ..MemberProfile::default()
            },
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .await
            .members
            .insert(member.id, member.clone());
        member
    }

    /// Insert a period directly, bypassing payment, and mark the member Active
    /// when the period covers now
    pub async fn seed_subscription(
        &self,
        member_id: Uuid,
        start_date: OffsetDateTime,
        end_date: OffsetDateTime,
    ) -> Subscription {
        let mut state = self.state.lock().await;
        let grade = state
            .members
            .get(&member_id)
            .map(|m| m.grade)
            .unwrap_or(MembershipGrade::Professional);
        let sub = Subscription {
            id: Uuid::new_v4(),
            member_id,
            grade,
            amount: crate::fees::subscription_fee(grade),
            start_date,
            end_date,
            transaction_id: Uuid::new_v4(),
            created_at: OffsetDateTime::now_utc(),
        };
        if sub.covers(OffsetDateTime::now_utc()) {
            if let Some(member) = state.members.get_mut(&member_id) {
                member.status = MemberStatus::Active;
            }
        }
        state.subscriptions.push(sub.clone());
        sub
    }

    pub async fn seed_tool(&self, slug: &str, credit_cost: i64) -> Tool {
        let tool = Tool {
            id: Uuid::new_v4(),
            slug: slug.to_string(),
            name: slug.replace('-', " "),
            credit_cost,
            is_active: true,
        };
        self.state.lock().await.tools.insert(tool.id, tool.clone());
        tool
    }

    pub async fn set_credits(&self, member_id: Uuid, credits: i64) {
        if let Some(member) = self.state.lock().await.members.get_mut(&member_id) {
            member.credits = credits;
        }
    }

    pub async fn set_member_status(&self, member_id: Uuid, status: MemberStatus) {
        if let Some(member) = self.state.lock().await.members.get_mut(&member_id) {
            member.status = status;
        }
    }

    pub async fn set_application_status(&self, id: Uuid, status: ApplicationStatus) {
        if let Some(app) = self.state.lock().await.applications.get_mut(&id) {
            app.status = status;
        }
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }

    pub async fn tool_usages(&self, member_id: Uuid) -> Vec<ToolUsage> {
        self.state
            .lock()
            .await
            .tool_usages
            .iter()
            .filter(|u| u.member_id == member_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn begin(&self) -> BillingResult<Box<dyn LedgerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryLedgerTx { guard, working }))
    }

    async fn create_member(&self, new: NewMember) -> BillingResult<Member> {
        let mut state = self.state.lock().await;
        if state
            .members
            .values()
            .any(|m| m.identity_id == new.identity_id)
        {
            return Err(BillingError::InvalidInput(
                "Member already exists for this identity".to_string(),
            ));
        }
        if state
            .members
            .values()
            .any(|m| m.membership_id == new.membership_id)
        {
            return Err(BillingError::DuplicateMembershipId(new.membership_id));
        }
        let now = OffsetDateTime::now_utc();
        let member = Member {
            id: Uuid::new_v4(),
            identity_id: new.identity_id,
            membership_id: new.membership_id,
            member_type: new.member_type,
            grade: new.grade,
            status: MemberStatus::Pending,
            credits: 0,
            profile: new.profile,
            created_at: now,
            updated_at: now,
        };
        state.members.insert(member.id, member.clone());
        Ok(member)
    }

    async fn get_member(&self, member_id: Uuid) -> BillingResult<Option<Member>> {
        Ok(self.state.lock().await.members.get(&member_id).cloned())
    }

    async fn get_member_by_identity(&self, identity_id: Uuid) -> BillingResult<Option<Member>> {
        Ok(self
            .state
            .lock()
            .await
            .members
            .values()
            .find(|m| m.identity_id == identity_id)
            .cloned())
    }

    async fn update_profile(
        &self,
        member_id: Uuid,
        profile: &MemberProfile,
    ) -> BillingResult<Option<Member>> {
        let mut state = self.state.lock().await;
        Ok(state.members.get_mut(&member_id).map(|m| {
            m.profile = profile.clone();
            m.updated_at = OffsetDateTime::now_utc();
            m.clone()
        }))
    }

    async fn expire_lapsed_members(&self, now: OffsetDateTime) -> BillingResult<Vec<Uuid>> {
        let mut state = self.state.lock().await;
        let lapsed: Vec<Uuid> = state
            .members
            .values()
            .filter(|m| m.status == MemberStatus::Active && state.covering(m.id, now).is_none())
            .map(|m| m.id)
            .collect();
        for id in &lapsed {
            if let Some(member) = state.members.get_mut(id) {
                member.status = MemberStatus::Expired;
                member.updated_at = now;
            }
        }
        Ok(lapsed)
    }

    async fn subscription_covering(
        &self,
        member_id: Uuid,
        at: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self.state.lock().await.covering(member_id, at).cloned())
    }

    async fn list_subscriptions(&self, member_id: Uuid) -> BillingResult<Vec<Subscription>> {
        let mut subs: Vec<Subscription> = self
            .state
            .lock()
            .await
            .subscriptions
            .iter()
            .filter(|s| s.member_id == member_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        Ok(subs)
    }

    async fn increment_credits(&self, member_id: Uuid, amount: i64) -> BillingResult<i64> {
        self.state.lock().await.add_credits(member_id, amount)
    }

    async fn debit_credits(
        &self,
        member_id: Uuid,
        tool_id: Uuid,
        cost: i64,
    ) -> BillingResult<DebitOutcome> {
        let mut state = self.state.lock().await;
        let member = state.member_mut(member_id)?;
        if member.credits < cost {
            return Ok(DebitOutcome::Insufficient {
                balance: member.credits,
            });
        }
        let now = OffsetDateTime::now_utc();
        member.credits -= cost;
        member.updated_at = now;
        let balance = member.credits;

        let usage = ToolUsage {
            id: Uuid::new_v4(),
            member_id,
            tool_id,
            credits_used: cost,
            used_at: now,
        };
        state.tool_usages.push(usage.clone());
        Ok(DebitOutcome::Debited { usage, balance })
    }

    async fn get_tool(&self, tool_id: Uuid) -> BillingResult<Option<Tool>> {
        Ok(self.state.lock().await.tools.get(&tool_id).cloned())
    }

    async fn list_tools(&self) -> BillingResult<Vec<Tool>> {
        let mut tools: Vec<Tool> = self
            .state
            .lock()
            .await
            .tools
            .values()
            .filter(|t| t.is_active)
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(tools)
    }

    async fn insert_application(&self, new: NewApplication) -> BillingResult<Application> {
        let now = OffsetDateTime::now_utc();
        let app = Application {
            id: Uuid::new_v4(),
            member_id: new.member_id,
            application_type: new.application_type,
            applicant_type: new.applicant_type,
            title: new.title,
            site_address: new.site_address,
            status: ApplicationStatus::Draft,
            amount: new.amount,
            certificate_number: None,
            certificate_url: None,
            rejection_reason: None,
            submitted_at: None,
            created_at: now,
            updated_at: now,
        };
        self.state
            .lock()
            .await
            .applications
            .insert(app.id, app.clone());
        Ok(app)
    }

    async fn get_application(&self, id: Uuid) -> BillingResult<Option<Application>> {
        Ok(self.state.lock().await.applications.get(&id).cloned())
    }

    async fn list_applications(&self, member_id: Uuid) -> BillingResult<Vec<Application>> {
        let mut apps: Vec<Application> = self
            .state
            .lock()
            .await
            .applications
            .values()
            .filter(|a| a.member_id == member_id)
            .cloned()
            .collect();
        apps.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(apps)
    }

    async fn list_applications_by_status(
        &self,
        status: ApplicationStatus,
    ) -> BillingResult<Vec<Application>> {
        let mut apps: Vec<Application> = self
            .state
            .lock()
            .await
            .applications
            .values()
            .filter(|a| a.status == status)
            .cloned()
            .collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(apps)
    }

    async fn transition_application(
        &self,
        id: Uuid,
        from: ApplicationStatus,
        to: ApplicationStatus,
        rejection_reason: Option<&str>,
    ) -> BillingResult<Option<Application>> {
        let mut state = self.state.lock().await;
        let app = match state.applications.get_mut(&id) {
            Some(app) if app.status == from => app,
            _ => return Ok(None),
        };
        let now = OffsetDateTime::now_utc();
        app.status = to;
        app.updated_at = now;
        if to == ApplicationStatus::Submitted {
            app.submitted_at = Some(now);
        }
        if let Some(reason) = rejection_reason {
            app.rejection_reason = Some(reason.to_string());
        }
        Ok(Some(app.clone()))
    }

    async fn add_document(
        &self,
        application_id: Uuid,
        doc_type: &str,
        url: &str,
    ) -> BillingResult<ApplicationDocument> {
        let doc = ApplicationDocument {
            id: Uuid::new_v4(),
            application_id,
            doc_type: doc_type.to_string(),
            url: url.to_string(),
            uploaded_at: OffsetDateTime::now_utc(),
        };
        self.state.lock().await.documents.push(doc.clone());
        Ok(doc)
    }

    async fn list_documents(
        &self,
        application_id: Uuid,
    ) -> BillingResult<Vec<ApplicationDocument>> {
        Ok(self
            .state
            .lock()
            .await
            .documents
            .iter()
            .filter(|d| d.application_id == application_id)
            .cloned()
            .collect())
    }

    async fn insert_transaction(&self, new: NewTransaction) -> BillingResult<Transaction> {
        self.state.lock().await.insert_transaction(new)
    }

    async fn get_transaction(&self, reference: &str) -> BillingResult<Option<Transaction>> {
        Ok(self.state.lock().await.transactions.get(reference).cloned())
    }

    async fn pending_transactions_before(
        &self,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<Transaction>> {
        let mut pending: Vec<Transaction> = self
            .state
            .lock()
            .await
            .transactions
            .values()
            .filter(|t| t.status == TransactionStatus::Pending && t.created_at < cutoff)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn record_reconciliation_error(
        &self,
        reference: &str,
        message: &str,
    ) -> BillingResult<()> {
        if let Some(tx) = self.state.lock().await.transactions.get_mut(reference) {
            tx.last_error = Some(message.to_string());
            tx.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }
}

struct MemoryLedgerTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn lock_transaction(&mut self, reference: &str) -> BillingResult<Option<Transaction>> {
        Ok(self.working.transactions.get(reference).cloned())
    }

    async fn insert_transaction(&mut self, new: NewTransaction) -> BillingResult<Transaction> {
        self.working.insert_transaction(new)
    }

    async fn settle_transaction(
        &mut self,
        id: Uuid,
        status: TransactionStatus,
        gateway_response: Option<&serde_json::Value>,
    ) -> BillingResult<()> {
        let tx = self
            .working
            .transactions
            .values_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| BillingError::NotFound(format!("Transaction {}", id)))?;
        let now = OffsetDateTime::now_utc();
        tx.status = status;
        tx.gateway_response = gateway_response.cloned();
        tx.last_error = None;
        tx.updated_at = now;
        tx.settled_at = Some(now);
        Ok(())
    }

    async fn lock_member(&mut self, member_id: Uuid) -> BillingResult<Option<Member>> {
        Ok(self.working.members.get(&member_id).cloned())
    }

    async fn set_member_status(
        &mut self,
        member_id: Uuid,
        status: MemberStatus,
    ) -> BillingResult<()> {
        let member = self.working.member_mut(member_id)?;
        member.status = status;
        member.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn increment_credits(&mut self, member_id: Uuid, amount: i64) -> BillingResult<i64> {
        self.working.add_credits(member_id, amount)
    }

    async fn latest_period_end(
        &mut self,
        member_id: Uuid,
    ) -> BillingResult<Option<OffsetDateTime>> {
        Ok(self
            .working
            .subscriptions
            .iter()
            .filter(|s| s.member_id == member_id)
            .map(|s| s.end_date)
            .max())
    }

    async fn insert_subscription(&mut self, new: NewSubscription) -> BillingResult<Subscription> {
        let sub = Subscription {
            id: Uuid::new_v4(),
            member_id: new.member_id,
            grade: new.grade,
            amount: new.amount,
            start_date: new.start_date,
            end_date: new.end_date,
            transaction_id: new.transaction_id,
            created_at: OffsetDateTime::now_utc(),
        };
        self.working.subscriptions.push(sub.clone());
        Ok(sub)
    }

    async fn lock_application(&mut self, id: Uuid) -> BillingResult<Option<Application>> {
        Ok(self.working.applications.get(&id).cloned())
    }

    async fn set_application_status(
        &mut self,
        id: Uuid,
        status: ApplicationStatus,
    ) -> BillingResult<()> {
        let app = self.working.application_mut(id)?;
        app.status = status;
        app.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn next_certificate_serial(&mut self, year: i32) -> BillingResult<i64> {
        let serial = self.working.certificate_counters.entry(year).or_insert(0);
        *serial += 1;
        Ok(*serial)
    }

    async fn set_certificate(&mut self, id: Uuid, number: &str, url: &str) -> BillingResult<()> {
        let app = self.working.application_mut(id)?;
        app.certificate_number = Some(number.to_string());
        app.certificate_url = Some(url.to_string());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> BillingResult<()> {
        let MemoryLedgerTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

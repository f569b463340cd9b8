//! Member records

use std::sync::Arc;

use nitp_shared::{generate_membership_id, Member, MemberProfile, MemberType, MembershipGrade};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::store::{BillingStore, NewMember};

fn validate_profile(profile: &MemberProfile) -> BillingResult<()> {
    if profile.full_name.trim().is_empty() {
        return Err(BillingError::InvalidInput("full_name is required".to_string()));
    }
    if let Some(year) = profile.graduation_year {
        let current = OffsetDateTime::now_utc().year();
        if !(1900..=current + 10).contains(&year) {
            return Err(BillingError::InvalidInput(format!(
                "graduation_year {} is out of range",
                year
            )));
        }
    }
    Ok(())
}

/// Fresh membership ids drawn per registration attempt
const MEMBERSHIP_ID_ATTEMPTS: u32 = 5;

type MembershipIdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Clone)]
pub struct MemberService {
    store: Arc<dyn BillingStore>,
    membership_ids: MembershipIdGenerator,
}

impl MemberService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self {
            store,
            membership_ids: Arc::new(generate_membership_id),
        }
    }

    /// Replace the membership id source
    pub fn with_membership_ids(
        mut self,
        generator: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        self.membership_ids = Arc::new(generator);
        self
    }

    /// Create the member record for a freshly registered identity.
    /// New members start Pending with no credits.
    pub async fn register(
        &self,
        identity_id: Uuid,
        member_type: MemberType,
        grade: MembershipGrade,
        profile: MemberProfile,
    ) -> BillingResult<Member> {
        validate_profile(&profile)?;

        for attempt in 1..=MEMBERSHIP_ID_ATTEMPTS {
            let result = self
                .store
                .create_member(NewMember {
                    identity_id,
                    membership_id: (self.membership_ids)(),
                    member_type,
                    grade,
                    profile: profile.clone(),
                })
                .await;

            match result {
                Ok(member) => {
                    tracing::info!(
                        member_id = %member.id,
                        membership_id = %member.membership_id,
                        grade = %member.grade,
                        "Member registered"
                    );
                    return Ok(member);
                }
                Err(BillingError::DuplicateMembershipId(taken)) => {
                    tracing::warn!(
                        attempt,
                        membership_id = %taken,
                        "Membership id already taken, drawing another"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(BillingError::Internal(format!(
            "No free membership id after {} attempts",
            MEMBERSHIP_ID_ATTEMPTS
        )))
    }

    pub async fn get(&self, member_id: Uuid) -> BillingResult<Member> {
        self.store
            .get_member(member_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Member {}", member_id)))
    }

    pub async fn get_by_identity(&self, identity_id: Uuid) -> BillingResult<Member> {
        self.store
            .get_member_by_identity(identity_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("Member profile".to_string()))
    }

    pub async fn update_profile(
        &self,
        member_id: Uuid,
        profile: MemberProfile,
    ) -> BillingResult<Member> {
        validate_profile(&profile)?;
        self.store
            .update_profile(member_id, &profile)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Member {}", member_id)))
    }

    /// Active members whose last period has ended become Expired
    pub async fn expire_lapsed_members(&self) -> BillingResult<Vec<Uuid>> {
        let expired = self
            .store
            .expire_lapsed_members(OffsetDateTime::now_utc())
            .await?;
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Lapsed memberships expired");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use nitp_shared::{is_membership_id, MemberStatus};
    use time::Duration;

    fn profile(name: &str) -> MemberProfile {
        MemberProfile {
            full_name: name.to_string(),
            graduation_year: Some(2015),
            ..MemberProfile::default()
        }
    }

    #[tokio::test]
    async fn test_register_starts_pending() {
        let store = MemoryStore::new();
        let service = MemberService::new(Arc::new(store));
        let member = service
            .register(
                Uuid::new_v4(),
                MemberType::Individual,
                MembershipGrade::Associate,
                profile("Ada Obi"),
            )
            .await
            .unwrap();

        assert_eq!(member.status, MemberStatus::Pending);
        assert_eq!(member.credits, 0);
        assert!(is_membership_id(&member.membership_id));
    }

    fn scripted_ids(ids: &[&str]) -> impl Fn() -> String + Send + Sync + 'static {
        let queue = std::sync::Mutex::new(
            ids.iter()
                .map(|id| id.to_string())
                .collect::<std::collections::VecDeque<_>>(),
        );
        move || queue.lock().unwrap().pop_front().unwrap()
    }

    #[tokio::test]
    async fn test_register_retries_taken_membership_id() {
        let store = MemoryStore::new();
        let service = MemberService::new(Arc::new(store.clone()))
            .with_membership_ids(scripted_ids(&["TP-A00000001", "TP-A00000001", "TP-A00000002"]));

        let first = service
            .register(
                Uuid::new_v4(),
                MemberType::Individual,
                MembershipGrade::Associate,
                profile("Ada Obi"),
            )
            .await
            .unwrap();
        let second = service
            .register(
                Uuid::new_v4(),
                MemberType::Individual,
                MembershipGrade::Student,
                profile("Chidi Eze"),
            )
            .await
            .unwrap();

        assert_eq!(first.membership_id, "TP-A00000001");
        assert_eq!(second.membership_id, "TP-A00000002");
        assert_eq!(second.profile.full_name, "Chidi Eze");
    }

    #[tokio::test]
    async fn test_register_gives_up_after_repeated_collisions() {
        let store = MemoryStore::new();
        let service = MemberService::new(Arc::new(store.clone()))
            .with_membership_ids(|| "TP-A00000009".to_string());

        service
            .register(
                Uuid::new_v4(),
                MemberType::Individual,
                MembershipGrade::Associate,
                profile("Ada Obi"),
            )
            .await
            .unwrap();
        let err = service
            .register(
                Uuid::new_v4(),
                MemberType::Corporate,
                MembershipGrade::Fellow,
                profile("Planwell Ltd"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Internal(_)));
    }

    #[tokio::test]
    async fn test_blank_name_rejected() {
        let service = MemberService::new(Arc::new(MemoryStore::new()));
        let err = service
            .register(
                Uuid::new_v4(),
                MemberType::Individual,
                MembershipGrade::Student,
                profile("  "),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_expiry_sweep_only_touches_lapsed_active_members() {
        let store = MemoryStore::new();
        let now = OffsetDateTime::now_utc();

        let current = store
            .seed_member(MemberType::Individual, MembershipGrade::Professional)
            .await;
        store
            .seed_subscription(current.id, now - Duration::days(10), now + Duration::days(355))
            .await;

        let lapsed = store
            .seed_member(MemberType::Individual, MembershipGrade::Professional)
            .await;
        store
            .seed_subscription(lapsed.id, now - Duration::days(800), now - Duration::days(435))
            .await;
        store.set_member_status(lapsed.id, MemberStatus::Active).await;

        let pending = store
            .seed_member(MemberType::Individual, MembershipGrade::Student)
            .await;

        let service = MemberService::new(Arc::new(store.clone()));
        let expired = service.expire_lapsed_members().await.unwrap();

        assert_eq!(expired, vec![lapsed.id]);
        assert_eq!(
            service.get(lapsed.id).await.unwrap().status,
            MemberStatus::Expired
        );
        assert_eq!(
            service.get(current.id).await.unwrap().status,
            MemberStatus::Active
        );
        assert_eq!(
            service.get(pending.id).await.unwrap().status,
            MemberStatus::Pending
        );
    }
}

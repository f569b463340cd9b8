//! Fee schedules
//!
//! Both schedules are fixed lookup tables in whole Naira. The subscription
//! table is total over [`MembershipGrade`]; the application table is an
//! explicit list of entries and a missing combination is an error rather
//! than a free application.

use nitp_shared::{ApplicantType, ApplicationType, MembershipGrade};
use serde::Serialize;

use crate::error::{BillingError, BillingResult};

/// Administrative fee added to every application
pub const APPLICATION_ADMIN_FEE: i64 = 5_200;

/// Annual subscription fee for a membership grade
pub fn subscription_fee(grade: MembershipGrade) -> i64 {
    match grade {
        MembershipGrade::Student => 5_000,
        MembershipGrade::Associate => 25_000,
        MembershipGrade::Professional => 50_000,
        MembershipGrade::Fellow => 75_000,
    }
}

/// Breakdown of an application fee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApplicationFee {
    pub application_type: ApplicationType,
    pub applicant_type: ApplicantType,
    pub base_fee: i64,
    pub admin_fee: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEntry {
    pub application_type: ApplicationType,
    pub applicant_type: ApplicantType,
    pub base_fee: i64,
}

const STANDARD_APPLICATION_FEES: &[FeeEntry] = &[
    FeeEntry {
        application_type: ApplicationType::Sar,
        applicant_type: ApplicantType::Individual,
        base_fee: 25_000,
    },
    FeeEntry {
        application_type: ApplicationType::Sar,
        applicant_type: ApplicantType::Corporate,
        base_fee: 50_000,
    },
    FeeEntry {
        application_type: ApplicationType::Eiar,
        applicant_type: ApplicantType::Individual,
        base_fee: 75_000,
    },
    FeeEntry {
        application_type: ApplicationType::Eiar,
        applicant_type: ApplicantType::Corporate,
        base_fee: 150_000,
    },
];

/// Application fee table
#[derive(Debug, Clone)]
pub struct FeeSchedule {
    entries: Vec<FeeEntry>,
    admin_fee: i64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self::standard()
    }
}

impl FeeSchedule {
    /// The association's published schedule
    pub fn standard() -> Self {
        Self {
            entries: STANDARD_APPLICATION_FEES.to_vec(),
            admin_fee: APPLICATION_ADMIN_FEE,
        }
    }

    pub fn from_entries(entries: Vec<FeeEntry>, admin_fee: i64) -> Self {
        Self { entries, admin_fee }
    }

    pub fn entries(&self) -> &[FeeEntry] {
        &self.entries
    }

    /// Fee for an application type and applicant type
    pub fn calculate_application_fee(
        &self,
        application_type: ApplicationType,
        applicant_type: ApplicantType,
    ) -> BillingResult<ApplicationFee> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.application_type == application_type && e.applicant_type == applicant_type)
            .ok_or(BillingError::NoFeeSchedule {
                application_type,
                applicant_type,
            })?;

        Ok(ApplicationFee {
            application_type,
            applicant_type,
            base_fee: entry.base_fee,
            admin_fee: self.admin_fee,
            total: entry.base_fee + self.admin_fee,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sar_individual_fee() {
        let fee = FeeSchedule::standard()
            .calculate_application_fee(ApplicationType::Sar, ApplicantType::Individual)
            .unwrap();
        assert_eq!(fee.base_fee, 25_000);
        assert_eq!(fee.admin_fee, 5_200);
        assert_eq!(fee.total, 30_200);
    }

    #[test]
    fn test_every_standard_pair_is_priced_and_stable() {
        let schedule = FeeSchedule::standard();
        for application_type in ApplicationType::all() {
            for applicant_type in ApplicantType::all() {
                let first = schedule
                    .calculate_application_fee(*application_type, *applicant_type)
                    .unwrap();
                let second = schedule
                    .calculate_application_fee(*application_type, *applicant_type)
                    .unwrap();
                assert_eq!(first, second);
                assert!(first.total > APPLICATION_ADMIN_FEE);
            }
        }
    }

    #[test]
    fn test_unmapped_pair_is_an_error_not_zero() {
        let schedule = FeeSchedule::from_entries(
            vec![FeeEntry {
                application_type: ApplicationType::Sar,
                applicant_type: ApplicantType::Individual,
                base_fee: 25_000,
            }],
            APPLICATION_ADMIN_FEE,
        );

        let result =
            schedule.calculate_application_fee(ApplicationType::Eiar, ApplicantType::Corporate);
        assert!(matches!(
            result,
            Err(BillingError::NoFeeSchedule {
                application_type: ApplicationType::Eiar,
                applicant_type: ApplicantType::Corporate,
            })
        ));
    }

    #[test]
    fn test_subscription_fee_table() {
        assert_eq!(subscription_fee(MembershipGrade::Professional), 50_000);
        assert_eq!(subscription_fee(MembershipGrade::Student), 5_000);
        assert!(subscription_fee(MembershipGrade::Fellow) > subscription_fee(MembershipGrade::Associate));
    }
}

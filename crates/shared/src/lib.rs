#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! NITP Shared Types
//!
//! Database pool setup, embedded migrations and the typed entity records
//! shared by the API server, the billing core and the background worker.

pub mod db;
pub mod identifiers;
pub mod models;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use identifiers::{generate_membership_id, is_membership_id, Identifier};
pub use models::{
    ApplicantType, Application, ApplicationDocument, ApplicationStatus, ApplicationType, Member,
    MemberProfile, MemberStatus, MemberType, MembershipGrade, ParseEnumError, PaymentPurpose,
    Subscription, Tool, ToolUsage, Transaction, TransactionStatus, TransactionType,
};

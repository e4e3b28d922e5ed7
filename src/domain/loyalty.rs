use super::session::{CustomerId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoyaltyKind {
    Earn,
    Bonus,
    Redeem,
}

/// An append-only ledger entry. A customer's balance is the running sum of
/// `points` over all entries for that customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoyaltyTransaction {
    pub id: Uuid,
    pub customer: CustomerId,
    pub session: Option<SessionId>,
    pub kind: LoyaltyKind,
    pub points: i64,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl LoyaltyTransaction {
    /// Points earned by paying for a session.
    pub fn earn(
        customer: CustomerId,
        session: SessionId,
        points: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            customer,
            session: Some(session),
            kind: LoyaltyKind::Earn,
            points: i64::from(points),
            description: format!("Earned from session {session}"),
            created_at,
        }
    }

    /// Offsetting entry for a previously recorded earn. Never edits the original.
    pub fn reversal_of(original: &Self, created_at: DateTime<Utc>) -> Self {
        let session = original
            .session
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        Self {
            id: Uuid::new_v4(),
            customer: original.customer,
            session: original.session,
            kind: LoyaltyKind::Redeem,
            points: -original.points,
            description: format!("Reversal for voided session {session}"),
            created_at,
        }
    }
}

use crate::domain::payment::{PaymentInput, PaymentMethod};
use crate::domain::session::{BillingMode, CustomerId, NewSession, StationId};
use crate::domain::staff::{Role, Staff};
use crate::error::{BillingError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum OpKind {
    Station,
    Start,
    Settle,
    ForceEnd,
    Void,
}

/// One raw row of a desk-operations file. Columns an operation does not use
/// are left empty.
#[derive(Debug, Deserialize)]
struct OperationRecord {
    op: OpKind,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    station: Option<u32>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    customer: Option<u32>,
    #[serde(default)]
    secondary: Option<u32>,
    #[serde(default)]
    game: Option<String>,
    #[serde(default)]
    mode: Option<BillingMode>,
    #[serde(default)]
    rate: Option<Decimal>,
    #[serde(default)]
    at: Option<DateTime<Utc>>,
    #[serde(default)]
    payment: Option<PaymentMethod>,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    role: Option<Role>,
}

/// A desk operation, keyed by the file's own session label.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    RegisterStation {
        station: StationId,
        name: String,
    },
    Start {
        session: String,
        request: NewSession,
        at: DateTime<Utc>,
    },
    Settle {
        session: String,
        payment: PaymentInput,
        at: DateTime<Utc>,
    },
    ForceEnd {
        session: String,
        staff: Staff,
        at: DateTime<Utc>,
    },
    Void {
        session: String,
        staff: Staff,
        at: DateTime<Utc>,
    },
}

fn required<T>(value: Option<T>, column: &str, op: &str) -> Result<T> {
    value.ok_or_else(|| BillingError::ValidationError(format!("{op} requires a {column} column")))
}

impl TryFrom<OperationRecord> for Operation {
    type Error = BillingError;

    fn try_from(record: OperationRecord) -> Result<Self> {
        // Admin rights must be stated on the row.
        let role = record.role.unwrap_or(Role::Attendant);
        let staff = |actor: Option<String>, op: &str| -> Result<Staff> {
            Ok(Staff {
                name: required(actor, "actor", op)?,
                role,
            })
        };

        match record.op {
            OpKind::Station => Ok(Operation::RegisterStation {
                station: StationId(required(record.station, "station", "station")?),
                name: record.name.unwrap_or_default(),
            }),
            OpKind::Start => Ok(Operation::Start {
                session: required(record.session, "session", "start")?,
                request: NewSession {
                    primary_customer: CustomerId(required(record.customer, "customer", "start")?),
                    secondary_customer: record.secondary.map(CustomerId),
                    station: StationId(required(record.station, "station", "start")?),
                    game: record.game.unwrap_or_default(),
                    mode: required(record.mode, "mode", "start")?,
                    rate: required(record.rate, "rate", "start")?,
                },
                at: required(record.at, "at", "start")?,
            }),
            OpKind::Settle => {
                let payment = match required(record.payment, "payment", "settle")? {
                    PaymentMethod::Cash => PaymentInput::Cash,
                    PaymentMethod::MobileMoneyManual => PaymentInput::MobileMoneyManual {
                        reference: required(record.reference, "reference", "settle")?,
                    },
                    PaymentMethod::MobileMoneyPush => {
                        return Err(BillingError::ValidationError(
                            "push payments need a live gateway and cannot be replayed".to_string(),
                        ));
                    }
                };
                Ok(Operation::Settle {
                    session: required(record.session, "session", "settle")?,
                    payment,
                    at: required(record.at, "at", "settle")?,
                })
            }
            OpKind::ForceEnd => Ok(Operation::ForceEnd {
                session: required(record.session, "session", "force_end")?,
                staff: staff(record.actor, "force_end")?,
                at: required(record.at, "at", "force_end")?,
            }),
            OpKind::Void => Ok(Operation::Void {
                session: required(record.session, "session", "void")?,
                staff: staff(record.actor, "void")?,
                at: required(record.at, "at", "void")?,
            }),
        }
    }
}

/// Reads desk operations from a CSV source.
///
/// Whitespace is trimmed and rows may omit trailing columns.
pub struct OperationReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> OperationReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily parses each row. A bad row yields an error without ending the stream.
    pub fn operations(self) -> impl Iterator<Item = Result<Operation>> {
        self.reader
            .into_deserialize::<OperationRecord>()
            .map(|result| result.map_err(BillingError::from).and_then(Operation::try_from))
    }
}

use crate::domain::session::{CustomerId, Session};
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct SessionRow<'a> {
    session: &'a str,
    station: u32,
    customer: u32,
    secondary: Option<u32>,
    game: &'a str,
    mode: String,
    rate: String,
    status: String,
    duration_minutes: Option<i64>,
    amount: Option<String>,
    points: Option<u32>,
    method: Option<String>,
    reference: Option<&'a str>,
}

impl<'a> SessionRow<'a> {
    fn new(label: &'a str, session: &'a Session) -> Self {
        let billing = session.billing.as_ref();
        Self {
            session: label,
            station: session.station.0,
            customer: session.primary_customer.0,
            secondary: session.secondary_customer.map(|c| c.0),
            game: &session.game,
            mode: session.mode.to_string(),
            rate: session.rate.to_string(),
            status: session.status.to_string(),
            duration_minutes: billing.map(|b| b.duration_minutes),
            amount: billing.map(|b| b.amount_charged.to_string()),
            points: billing.map(|b| b.points_earned),
            method: session.payment.as_ref().map(|p| p.method().to_string()),
            reference: session.mpesa_reference(),
        }
    }
}

#[derive(Debug, Serialize)]
struct BalanceRow {
    customer: u32,
    points: i64,
}

/// Writes the replay report: the session table, a blank line, then balances.
pub struct SessionWriter<W: Write> {
    inner: W,
}

impl<W: Write> SessionWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes one row per session, labelled with the key used in the input file.
    pub fn write_sessions<'a, I>(&mut self, sessions: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a Session)>,
    {
        let mut writer = csv::Writer::from_writer(&mut self.inner);
        for (label, session) in sessions {
            writer.serialize(SessionRow::new(label, session))?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write_balances<I>(&mut self, balances: I) -> Result<()>
    where
        I: IntoIterator<Item = (CustomerId, i64)>,
    {
        self.inner.write_all(b"\n")?;
        let mut writer = csv::Writer::from_writer(&mut self.inner);
        for (customer, points) in balances {
            writer.serialize(BalanceRow {
                customer: customer.0,
                points,
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

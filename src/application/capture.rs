use super::push::{PushHandle, PushPaymentFlow};
use crate::domain::money::Money;
use crate::domain::payment::{CapturedPayment, PaymentInput, PhoneNumber, parse_reference};
use crate::domain::session::SessionId;
use crate::error::Result;

/// Where a capture stands right after staff submit the payment form.
pub enum CaptureProgress {
    /// Cash or a valid manual reference: ready to commit.
    Complete(CapturedPayment),
    /// A push was sent; commit only once the handle yields a captured payment.
    Push(PushHandle),
}

impl CaptureProgress {
    /// The captured payment if the capture can be committed right now.
    pub fn captured(&self) -> Option<CapturedPayment> {
        match self {
            CaptureProgress::Complete(payment) => Some(payment.clone()),
            CaptureProgress::Push(handle) => handle.captured(),
        }
    }
}

/// Collects payment-method-specific input and turns it into a capture.
///
/// Validation happens before any network call.
#[derive(Clone)]
pub struct PaymentCapture {
    push: PushPaymentFlow,
    min_reference_len: usize,
}

impl PaymentCapture {
    pub fn new(push: PushPaymentFlow, min_reference_len: usize) -> Self {
        Self {
            push,
            min_reference_len,
        }
    }

    pub fn begin(
        &self,
        session: SessionId,
        amount: Money,
        input: PaymentInput,
    ) -> Result<CaptureProgress> {
        match input {
            PaymentInput::Cash => Ok(CaptureProgress::Complete(CapturedPayment::Cash)),
            PaymentInput::MobileMoneyManual { reference } => {
                let reference = parse_reference(&reference, self.min_reference_len)?;
                Ok(CaptureProgress::Complete(
                    CapturedPayment::MobileMoneyManual { reference },
                ))
            }
            PaymentInput::MobileMoneyPush { phone } => {
                let phone = PhoneNumber::parse(&phone)?;
                Ok(CaptureProgress::Push(self.push.start(session, amount, phone)))
            }
        }
    }
}

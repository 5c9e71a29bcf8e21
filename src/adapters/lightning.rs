//! Lightning Network payments: pay an invoice, create an invoice, and look both up by id.

use std::future::Future;

use crate::error::EngineError;

#[derive(Clone, Debug, Default)]
pub struct Payment {
    pub is_confirmed: bool,
    pub is_failed: bool,
}

#[derive(Clone, Debug, Default)]
pub struct Invoice {
    /// BOLT-11 payment request string.
    pub request: String,
    /// Payment hash, used as the stable identifier for this leg.
    pub id: String,
    pub is_confirmed: bool,
    pub is_canceled: bool,
}

pub trait LightningBackend: Send + Sync {
    /// Pays a BOLT-11 invoice. Returns the payment hash.
    fn pay(&self, request: &str) -> impl Future<Output = Result<String, EngineError>> + Send;

    /// Looks up a payment by payment hash. `None` if unknown.
    fn get_payment(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<Payment>, EngineError>> + Send;

    /// Creates an invoice for `mtokens` millisatoshis.
    fn create_invoice(
        &self,
        mtokens: u64,
    ) -> impl Future<Output = Result<Invoice, EngineError>> + Send;

    /// Looks up a previously created invoice by payment hash.
    fn get_invoice(&self, id: &str) -> impl Future<Output = Result<Invoice, EngineError>> + Send;

    /// Total balance across open channels. Read for operator visibility only — intentionally
    /// excluded from the BalanceMonitor's PPM comparison (SPEC_FULL.md §9).
    fn get_channel_balance(&self) -> impl Future<Output = Result<u64, EngineError>> + Send;
}

pub mod api;
pub mod client;
pub mod store;

pub use client::CreditsLedgerClient;
pub use store::{HttpLedgerStore, LedgerMutation, LedgerOutcome, LedgerStore};

//! # Textcast Channels
//! Outbound SMS transports.
//!
//! The delivery engine only needs "send this text to this number, tell me
//! whether it worked and what the provider called it". Everything
//! provider-specific lives behind [`SmsTransport`].

pub mod phone;
pub mod sms;

pub use phone::normalize_phone;
pub use sms::{LogTransport, SmsReceipt, SmsTransport, TwilioTransport, WebhookTransport};

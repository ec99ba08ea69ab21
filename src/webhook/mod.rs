//! Inbound Jira webhooks.
//!
//! - [`signature`]: HMAC-SHA256 verification of the raw body
//! - [`event`]: normalization of the body into a [`JiraEvent`]

pub mod event;
pub mod signature;

pub use event::{ChangelogItem, EventParseError, JiraEvent};
pub use signature::{
    compute_signature, format_signature_header, parse_signature_header, sign_payload,
    verify_signature, SIGNATURE_HEADER,
};

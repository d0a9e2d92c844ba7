/// Email authentication module (DKIM signing, SPF evaluation)
///
/// - [`dkim`]: signs outbound mail; failures degrade to unsigned delivery
/// - [`spf`]: advisory check of inbound senders against `v=spf1` records

pub mod dkim;
pub mod spf;

pub use dkim::{sign_or_passthrough, DkimSigner};
pub use spf::{SpfResult, SpfValidator};

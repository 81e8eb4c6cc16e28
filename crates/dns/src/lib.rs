pub mod doh;
pub mod verify;

pub use doh::{DnsError, DohClient, RecordType};
pub use verify::{verification_host, verification_value, DomainCheck, VerificationOutcome};

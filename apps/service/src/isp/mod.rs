//! ISP classification of IPv4 addresses.
//!
//! An address is mapped to its origin ASN through Team Cymru's DNS TXT
//! interface, the ASN is matched against the configured rule table, and
//! unconfigured ASNs fall back to a cleaned-up organization name.

pub mod classifier;
pub mod lookup;
pub mod rules;
#[cfg(test)]
pub mod testing;

pub use classifier::{Classifier, UNKNOWN_ISP};
pub use lookup::{DnsTxtResolver, LookupError, TxtResolver};
pub use rules::{IspRule, IspRules, RulesError};

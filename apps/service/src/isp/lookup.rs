use async_trait::async_trait;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{ResolveError, TokioResolver};
use std::net::Ipv4Addr;
use thiserror::Error;

/// Zone answering "which ASN originates this prefix"
pub const ORIGIN_ZONE: &str = "origin.asn.cymru.com";
/// Zone answering "what organization owns this ASN"
pub const ASN_ZONE: &str = "asn.cymru.com";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("TXT lookup for {name} failed: {source}")]
    Dns {
        name: String,
        #[source]
        source: ResolveError,
    },
    #[error("unexpected ASN record format: {0}")]
    Malformed(String),
}

/// Issues DNS TXT queries; swapped for a scripted fake in tests
#[async_trait]
pub trait TxtResolver: Send + Sync {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, LookupError>;
}

/// TXT resolver backed by hickory over Cloudflare's public resolvers
pub struct DnsTxtResolver {
    resolver: TokioResolver,
}

impl DnsTxtResolver {
    pub fn new() -> Self {
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::cloudflare(),
            TokioConnectionProvider::default(),
        )
        .build();

        tracing::info!("ASN resolver configured: Cloudflare 1.1.1.1 / 1.0.0.1");
        Self { resolver }
    }
}

impl Default for DnsTxtResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxtResolver for DnsTxtResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, LookupError> {
        let lookup = self
            .resolver
            .txt_lookup(name)
            .await
            .map_err(|source| LookupError::Dns { name: name.to_string(), source })?;

        Ok(lookup
            .iter()
            .map(|txt| txt.txt_data().iter().map(|chunk| String::from_utf8_lossy(chunk)).collect())
            .collect())
    }
}

/// `a.b.c.d` → `d.c.b.a.origin.asn.cymru.com.`
pub fn origin_query_name(address: Ipv4Addr) -> String {
    let [a, b, c, d] = address.octets();
    format!("{d}.{c}.{b}.{a}.{ORIGIN_ZONE}.")
}

/// `7922` → `AS7922.asn.cymru.com.`
pub fn asn_query_name(asn: u32) -> String {
    format!("AS{asn}.{ASN_ZONE}.")
}

/// Origin ASN from `"7922 | 1.2.3.0/24 | US | arin | 1997-12-01"`
///
/// Multi-origin prefixes list several space-separated ASNs; the first wins.
/// An unparsable ASN field yields 0.
pub fn parse_origin_record(record: &str) -> Result<u32, LookupError> {
    let mut fields = record.split('|');
    let asn_field = fields.next().unwrap_or_default();
    if fields.next().is_none() {
        return Err(LookupError::Malformed(record.to_string()));
    }

    Ok(asn_field.split_whitespace().next().and_then(|asn| asn.parse().ok()).unwrap_or(0))
}

/// Organization from `"7922 | US | arin | 1997-12-01 | COMCAST-7922 - Comcast ..., US"`
pub fn parse_asn_info_record(record: &str) -> Result<String, LookupError> {
    record
        .split('|')
        .nth(4)
        .map(|org| org.trim().to_string())
        .ok_or_else(|| LookupError::Malformed(record.to_string()))
}

const CORPORATE_SUFFIXES: [&str; 4] = [", Inc.", ", LLC", ", Ltd.", ", Corp."];

/// Heuristic tidy-up of a registry organization string
///
/// `"COMCAST-7922 - Comcast Cable Communications, Inc., US"` becomes
/// `"Comcast Cable Communications"`.
pub fn clean_org_name(org: &str) -> String {
    let mut name = match org.find(" - ") {
        Some(idx) if idx > 0 => &org[idx + 3..],
        _ => org,
    };

    if let Some(idx) = name.rfind(", ") {
        let code = &name[idx + 2..];
        if idx > 0 && (2..=4).contains(&code.len()) && code.chars().all(|c| c.is_ascii_alphabetic())
        {
            name = &name[..idx];
        }
    }

    for suffix in CORPORATE_SUFFIXES {
        if let Some(stripped) = name.strip_suffix(suffix) {
            name = stripped;
        }
    }

    name.trim().to_string()
}

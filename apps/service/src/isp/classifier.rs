use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::lookup::{
    LookupError, TxtResolver, asn_query_name, clean_org_name, origin_query_name,
    parse_asn_info_record, parse_origin_record,
};
use super::rules::IspRules;

/// ISP name returned whenever classification cannot complete
pub const UNKNOWN_ISP: &str = "Unknown";

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
pub const DEFAULT_MAX_CACHE_SIZE: usize = 10_000;

struct CacheEntry {
    isp: String,
    expires_at: Instant,
}

/// Address → ISP cache with FIFO eviction; hits do not refresh order
struct ClassificationCache {
    entries: HashMap<Ipv4Addr, CacheEntry>,
    order: VecDeque<Ipv4Addr>,
    max_size: usize,
}

impl ClassificationCache {
    fn new(max_size: usize) -> Self {
        Self { entries: HashMap::new(), order: VecDeque::new(), max_size: max_size.max(1) }
    }

    fn get_live(&self, address: &Ipv4Addr, now: Instant) -> Option<&str> {
        self.entries
            .get(address)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.isp.as_str())
    }

    fn insert(&mut self, address: Ipv4Addr, isp: String, expires_at: Instant) {
        if self.entries.remove(&address).is_some() {
            self.order.retain(|queued| *queued != address);
        }

        while self.entries.len() >= self.max_size {
            let Some(oldest) = self.order.pop_front() else { break };
            self.entries.remove(&oldest);
        }

        self.entries.insert(address, CacheEntry { isp, expires_at });
        self.order.push_back(address);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Resolves addresses to ISP display names and gates registration
///
/// Shared between the registration path and anything else that classifies;
/// the cache is read under a shared lock and only written on a miss.
pub struct Classifier {
    resolver: Arc<dyn TxtResolver>,
    rules: RwLock<IspRules>,
    cache: RwLock<ClassificationCache>,
    cache_ttl: Duration,
}

impl Classifier {
    pub fn new(resolver: Arc<dyn TxtResolver>) -> Self {
        Self::with_cache_limits(resolver, DEFAULT_CACHE_TTL, DEFAULT_MAX_CACHE_SIZE)
    }

    pub fn with_cache_limits(
        resolver: Arc<dyn TxtResolver>,
        cache_ttl: Duration,
        max_cache_size: usize,
    ) -> Self {
        Self {
            resolver,
            rules: RwLock::new(IspRules::default()),
            cache: RwLock::new(ClassificationCache::new(max_cache_size)),
            cache_ttl,
        }
    }

    /// Replace the whole rule table
    pub fn load_rules(&self, rules: IspRules) {
        *self.rules.write().unwrap_or_else(|e| e.into_inner()) = rules;
    }

    /// ISP display name for `address`, or [`UNKNOWN_ISP`]
    ///
    /// Lookup failures are never cached, so a transient DNS problem is
    /// retried on the next call.
    pub async fn classify_isp(&self, address: Ipv4Addr) -> String {
        if let Some(isp) = self.cached(address) {
            return isp;
        }

        match self.resolve(address).await {
            Ok(Some(isp)) => {
                let expires_at = Instant::now() + self.cache_ttl;
                self.cache.write().unwrap_or_else(|e| e.into_inner()).insert(
                    address,
                    isp.clone(),
                    expires_at,
                );
                isp
            }
            Ok(None) => UNKNOWN_ISP.to_string(),
            Err(e) => {
                warn!("ISP classification failed for {}: {}", address, e);
                UNKNOWN_ISP.to_string()
            }
        }
    }

    fn cached(&self, address: Ipv4Addr) -> Option<String> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.get_live(&address, Instant::now()).map(str::to_string)
    }

    /// `Ok(None)` means the lookup worked but gave nothing worth caching.
    async fn resolve(&self, address: Ipv4Addr) -> Result<Option<String>, LookupError> {
        let asn = self.lookup_origin_asn(address).await?;
        if asn == 0 {
            debug!("No origin ASN for {}", address);
            return Ok(None);
        }

        let configured = {
            let rules = self.rules.read().unwrap_or_else(|e| e.into_inner());
            rules.get(asn).map(|rule| rule.display.clone())
        };
        if let Some(display) = configured {
            return Ok(Some(display));
        }

        let records = self.resolver.lookup_txt(&asn_query_name(asn)).await?;
        let Some(record) = records.first() else {
            return Ok(None);
        };
        let name = clean_org_name(&parse_asn_info_record(record)?);
        Ok(if name.is_empty() { None } else { Some(name) })
    }

    async fn lookup_origin_asn(&self, address: Ipv4Addr) -> Result<u32, LookupError> {
        let records = self.resolver.lookup_txt(&origin_query_name(address)).await?;
        match records.first() {
            Some(record) => parse_origin_record(record),
            None => Ok(0),
        }
    }

    /// True iff a configured rule with this display name is allowed
    pub fn is_allowed(&self, isp: &str) -> bool {
        self.rules.read().unwrap_or_else(|e| e.into_inner()).is_allowed(isp)
    }

    pub fn allowed_isps(&self) -> BTreeSet<String> {
        self.rules.read().unwrap_or_else(|e| e.into_inner()).allowed_isps()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn clear_cache(&self) {
        self.cache.write().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn cache_size(&self) -> usize {
        self.cache.read().unwrap_or_else(|e| e.into_inner()).entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isp::testing::FakeResolver;

    fn rules() -> IspRules {
        IspRules::from_json_str(
            r#"{ "7922": { "display": "Comcast", "allowed": true },
                 "64500": { "display": "Starry", "allowed": false } }"#,
        )
        .unwrap()
    }

    fn classifier(resolver: Arc<FakeResolver>) -> Classifier {
        let classifier = Classifier::new(resolver);
        classifier.load_rules(rules());
        classifier
    }

    #[tokio::test]
    async fn test_configured_asn_uses_display_name() {
        let resolver = Arc::new(FakeResolver::default());
        let addr = Ipv4Addr::new(73, 1, 2, 3);
        resolver.answer_origin(addr, 7922);

        let classifier = classifier(resolver.clone());
        assert_eq!(classifier.classify_isp(addr).await, "Comcast");
        assert!(classifier.is_allowed("Comcast"));
        assert!(!classifier.is_allowed("Starry"));
        assert_eq!(resolver.query_count(), 1);
    }

    #[tokio::test]
    async fn test_repeat_classification_within_ttl_hits_cache() {
        let resolver = Arc::new(FakeResolver::default());
        let addr = Ipv4Addr::new(73, 1, 2, 3);
        resolver.answer_origin(addr, 7922);

        let classifier = classifier(resolver.clone());
        classifier.classify_isp(addr).await;
        classifier.classify_isp(addr).await;
        assert_eq!(resolver.query_count(), 1);
        assert_eq!(classifier.cache_size(), 1);

        classifier.clear_cache();
        assert_eq!(classifier.cache_size(), 0);
        assert_eq!(classifier.classify_isp(addr).await, "Comcast");
        assert_eq!(resolver.query_count(), 2);
    }

    #[tokio::test]
    async fn test_expired_entry_is_looked_up_again() {
        let resolver = Arc::new(FakeResolver::default());
        let addr = Ipv4Addr::new(73, 1, 2, 3);
        resolver.answer_origin(addr, 7922);

        let classifier = Classifier::with_cache_limits(resolver.clone(), Duration::ZERO, 10);
        classifier.load_rules(rules());
        classifier.classify_isp(addr).await;
        classifier.classify_isp(addr).await;
        assert_eq!(resolver.query_count(), 2);
        assert_eq!(classifier.cache_size(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let resolver = Arc::new(FakeResolver::default());
        let addr = Ipv4Addr::new(192, 0, 2, 1);

        let classifier = classifier(resolver.clone());
        assert_eq!(classifier.classify_isp(addr).await, UNKNOWN_ISP);
        assert_eq!(classifier.cache_size(), 0);

        resolver.answer_origin(addr, 0);
        assert_eq!(classifier.classify_isp(addr).await, UNKNOWN_ISP);
        assert_eq!(classifier.cache_size(), 0);
        assert_eq!(resolver.query_count(), 2);
    }

    #[tokio::test]
    async fn test_unconfigured_asn_falls_back_to_org_name() {
        let resolver = Arc::new(FakeResolver::default());
        let addr = Ipv4Addr::new(98, 10, 0, 1);
        resolver.answer_origin(addr, 701);
        resolver.answer(
            &asn_query_name(701),
            "701 | US | arin | 1990-08-03 | UUNET - MCI Communications Services, Inc., US",
        );

        let classifier = classifier(resolver.clone());
        assert_eq!(classifier.classify_isp(addr).await, "MCI Communications Services");
        assert!(!classifier.is_allowed("MCI Communications Services"));
        assert_eq!(classifier.cache_size(), 1);
    }

    #[tokio::test]
    async fn test_cache_evicts_in_insertion_order() {
        let resolver = Arc::new(FakeResolver::default());
        let addrs: Vec<Ipv4Addr> = (1..=4).map(|i| Ipv4Addr::new(73, 0, 0, i)).collect();
        for addr in &addrs {
            resolver.answer_origin(*addr, 7922);
        }

        let classifier = Classifier::with_cache_limits(resolver.clone(), DEFAULT_CACHE_TTL, 3);
        classifier.load_rules(rules());
        for addr in &addrs[..3] {
            classifier.classify_isp(*addr).await;
        }

        // A hit on the oldest entry must not protect it from eviction.
        classifier.classify_isp(addrs[0]).await;
        assert_eq!(resolver.query_count(), 3);

        classifier.classify_isp(addrs[3]).await;
        assert_eq!(classifier.cache_size(), 3);

        classifier.classify_isp(addrs[1]).await;
        assert_eq!(resolver.query_count(), 4, "second entry should still be cached");

        classifier.classify_isp(addrs[0]).await;
        assert_eq!(resolver.query_count(), 5, "first entry should have been evicted");
    }

    #[tokio::test]
    async fn test_load_rules_replaces_table() {
        let resolver = Arc::new(FakeResolver::default());
        let classifier = classifier(resolver);
        assert_eq!(classifier.rule_count(), 2);

        classifier.load_rules(
            IspRules::from_json_str(r#"{ "1": { "display": "Solo", "allowed": true } }"#).unwrap(),
        );
        assert_eq!(classifier.rule_count(), 1);
        assert!(!classifier.is_allowed("Comcast"));
        assert_eq!(classifier.allowed_isps().into_iter().collect::<Vec<_>>(), vec!["Solo"]);
    }
}

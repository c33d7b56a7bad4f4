//! Scripted TXT resolver for classifier and registry tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use super::lookup::{LookupError, TxtResolver, origin_query_name};

/// Unknown names fail like NXDOMAIN
#[derive(Default)]
pub struct FakeResolver {
    answers: Mutex<HashMap<String, Vec<String>>>,
    queries: Mutex<Vec<String>>,
}

impl FakeResolver {
    pub fn answer(&self, name: &str, record: &str) {
        self.answers.lock().unwrap().insert(name.to_string(), vec![record.to_string()]);
    }

    pub fn answer_origin(&self, address: Ipv4Addr, asn: u32) {
        self.answer(&origin_query_name(address), &format!("{asn} | 0.0.0.0/0 | US | arin | 2001-01-01"));
    }

    pub fn query_count(&self) -> usize {
        self.queries.lock().unwrap().len()
    }
}

#[async_trait]
impl TxtResolver for FakeResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, LookupError> {
        self.queries.lock().unwrap().push(name.to_string());
        self.answers
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| LookupError::Malformed(format!("no answer for {name}")))
    }
}

//! Resident self-registration and status lookup, plus the operator's
//! add, delete and list operations on the endpoint population.

use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use thiserror::Error;

use crate::database::Database;
use crate::database::models::{Endpoint, EndpointStatus, EventType, IspStats};
use crate::isp::UNKNOWN_ISP;
use crate::isp::Classifier;

const ENDPOINT_ID_PREFIX: &str = "CCC-Endpoint-";

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("only IPv4 addresses can be monitored")]
    NotIpv4,
    #[error("address {0} is not publicly routable")]
    NotRoutable(Ipv4Addr),
    #[error("ISP {isp} is not accepted for monitoring")]
    NotAllowed { isp: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub endpoint: Endpoint,
    pub already_registered: bool,
}

/// What a resident sees about their own connection
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationStatus {
    pub isp: String,
    pub registered: bool,
    pub allowed: bool,
    pub endpoint_id: Option<String>,
    pub status: Option<EndpointStatus>,
    /// Counts for the caller's ISP when it has registered endpoints
    pub isp_status: Option<IspStats>,
}

pub struct EndpointRegistry {
    database: Arc<dyn Database>,
    classifier: Arc<Classifier>,
}

impl EndpointRegistry {
    pub fn new(database: Arc<dyn Database>, classifier: Arc<Classifier>) -> Self {
        Self { database, classifier }
    }

    /// Parse a caller address, rejecting IPv6 and non-routable IPv4
    pub fn parse_address(raw: &str) -> Result<Ipv4Addr, RegistrationError> {
        let ip: IpAddr = raw
            .trim()
            .parse()
            .map_err(|_| RegistrationError::InvalidAddress(raw.to_string()))?;
        let IpAddr::V4(address) = ip else {
            return Err(RegistrationError::NotIpv4);
        };
        if is_private_or_local(address) {
            return Err(RegistrationError::NotRoutable(address));
        }
        Ok(address)
    }

    pub async fn register(&self, address: Ipv4Addr) -> Result<Registration, RegistrationError> {
        if is_private_or_local(address) {
            return Err(RegistrationError::NotRoutable(address));
        }

        if let Some(mut endpoint) = self.database.find_endpoint_by_address(address).await? {
            match self.database.touch_last_seen(&endpoint.id).await {
                Ok(()) => endpoint.last_seen = std::time::SystemTime::now(),
                Err(e) => tracing::warn!("Failed to update last_seen for {}: {}", endpoint.id, e),
            }
            return Ok(Registration { endpoint, already_registered: true });
        }

        let isp = self.classifier.classify_isp(address).await;
        if !self.classifier.is_allowed(&isp) {
            tracing::info!("Rejected registration from ISP {}", isp);
            return Err(RegistrationError::NotAllowed { isp });
        }

        let endpoint = Endpoint::new(generate_endpoint_id(), address, isp);
        self.database.create_endpoint(&endpoint).await?;
        tracing::info!("Registered endpoint {} ({})", endpoint.id, endpoint.isp);

        let message = format!("Endpoint {} registered on {}", endpoint.id, endpoint.isp);
        if let Err(e) = self
            .database
            .append_event(EventType::Registered, Some(&endpoint.isp), Some(&endpoint.id), &message)
            .await
        {
            tracing::warn!("Failed to record registration event for {}: {}", endpoint.id, e);
        }

        Ok(Registration { endpoint, already_registered: false })
    }

    /// Classify the caller and report its registration state.
    /// A registered caller counts as seen.
    pub async fn status(&self, address: Ipv4Addr) -> Result<RegistrationStatus, RegistrationError> {
        let existing = self.database.find_endpoint_by_address(address).await?;
        if let Some(endpoint) = &existing {
            if let Err(e) = self.database.touch_last_seen(&endpoint.id).await {
                tracing::warn!("Failed to update last_seen for {}: {}", endpoint.id, e);
            }
        }

        let isp = match &existing {
            Some(endpoint) => endpoint.isp.clone(),
            None => self.classifier.classify_isp(address).await,
        };
        let allowed = self.classifier.is_allowed(&isp);

        let isp_status = if isp == UNKNOWN_ISP {
            None
        } else {
            match self.database.isp_stats_by_name(&isp).await {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::warn!("Failed to read ISP status for {}: {}", isp, e);
                    None
                }
            }
        };

        Ok(RegistrationStatus {
            isp,
            registered: existing.is_some(),
            allowed,
            endpoint_id: existing.as_ref().map(|ep| ep.id.clone()),
            status: existing.map(|ep| ep.status),
            isp_status,
        })
    }

    /// Operator add: skips the allow-list and classifies only when no ISP is
    /// given. An address that is already registered is returned unchanged.
    pub async fn add(
        &self,
        address: Ipv4Addr,
        isp: Option<String>,
    ) -> Result<Registration, RegistrationError> {
        if is_private_or_local(address) {
            return Err(RegistrationError::NotRoutable(address));
        }

        if let Some(endpoint) = self.database.find_endpoint_by_address(address).await? {
            return Ok(Registration { endpoint, already_registered: true });
        }

        let isp = match isp.map(|name| name.trim().to_string()).filter(|name| !name.is_empty()) {
            Some(name) => name,
            None => self.classifier.classify_isp(address).await,
        };

        let endpoint = Endpoint::new(generate_endpoint_id(), address, isp);
        self.database.create_endpoint(&endpoint).await?;
        tracing::info!("Operator added endpoint {} ({})", endpoint.id, endpoint.isp);

        Ok(Registration { endpoint, already_registered: false })
    }

    /// Returns `false` when the id is unknown
    pub async fn delete(&self, id: &str) -> Result<bool, RegistrationError> {
        let deleted = self.database.delete_endpoint(id).await?;
        if deleted {
            tracing::info!("Deleted endpoint {}", id);
        }
        Ok(deleted)
    }

    /// Every endpoint, newest registration first
    pub async fn list(&self) -> Result<Vec<Endpoint>, RegistrationError> {
        let mut endpoints = self.database.list_all_endpoints().await?;
        endpoints.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(endpoints)
    }
}

fn generate_endpoint_id() -> String {
    let bytes: [u8; 4] = rand::random();
    format!("{}{}", ENDPOINT_ID_PREFIX, hex::encode(bytes))
}

fn is_private_or_local(address: Ipv4Addr) -> bool {
    address.is_private()
        || address.is_loopback()
        || address.is_link_local()
        || address.is_broadcast()
        || address.is_documentation()
        || address.is_unspecified()
        || address.is_multicast()
}

//! Per-service health state machine.
//!
//! Every tracked external service owns one [`HealthRecord`] behind its own
//! lock, so reports for `gmail` never contend with reports for `calendar`.
//!
//! Transitions:
//!
//! * `ok ↔ degraded` is driven by the consecutive failure counter.
//! * `auth_expired` is sticky: success and failure reports are ignored until
//!   [`HealthTracker::reset_auth`] is called.
//! * `config_error` is never entered by the failure counter, only by an
//!   explicit [`HealthTracker::record_config_error`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use gateway_primitives::ServiceId;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Consecutive failures after which a service is reported as degraded.
pub const FAILURE_THRESHOLD: u32 = 3;

/// Health status of a single external service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Calls are succeeding.
    Ok,
    /// Repeated failures; the service may be unavailable.
    Degraded,
    /// Credentials were revoked or expired; requires re-authorisation.
    AuthExpired,
    /// The integration is misconfigured.
    ConfigError,
}

impl HealthStatus {
    /// Returns the wire label for the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::AuthExpired => "auth_expired",
            Self::ConfigError => "config_error",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed health of one external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    service: ServiceId,
    status: HealthStatus,
    failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_success: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_attempt: Option<DateTime<Utc>>,
}

impl HealthRecord {
    fn new(service: ServiceId) -> Self {
        Self {
            service,
            status: HealthStatus::Ok,
            failure_count: 0,
            last_success: None,
            last_attempt: None,
        }
    }

    /// Returns the service identifier.
    #[must_use]
    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    /// Returns the current status.
    #[must_use]
    pub const fn status(&self) -> HealthStatus {
        self.status
    }

    /// Returns the number of consecutive failures since the last success.
    #[must_use]
    pub const fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Returns the time of the last successful call, if any.
    #[must_use]
    pub const fn last_success(&self) -> Option<DateTime<Utc>> {
        self.last_success
    }

    /// Returns the time of the last reported call, if any.
    #[must_use]
    pub const fn last_attempt(&self) -> Option<DateTime<Utc>> {
        self.last_attempt
    }
}

type SharedRecord = Arc<Mutex<HealthRecord>>;

/// Tracks the health of every external service the gateway talks to.
#[derive(Debug, Default)]
pub struct HealthTracker {
    services: RwLock<HashMap<ServiceId, SharedRecord>>,
}

impl HealthTracker {
    /// Creates a tracker with an `ok` record for each supplied service.
    #[must_use]
    pub fn new<I>(services: I) -> Self
    where
        I: IntoIterator<Item = ServiceId>,
    {
        let services = services
            .into_iter()
            .map(|id| {
                let record = Arc::new(Mutex::new(HealthRecord::new(id.clone())));
                (id, record)
            })
            .collect();
        Self {
            services: RwLock::new(services),
        }
    }

    fn entry(&self, service: &ServiceId) -> SharedRecord {
        if let Some(record) = self.services.read().get(service) {
            return Arc::clone(record);
        }
        let mut guard = self.services.write();
        Arc::clone(
            guard
                .entry(service.clone())
                .or_insert_with(|| Arc::new(Mutex::new(HealthRecord::new(service.clone())))),
        )
    }

    /// Records a successful call. Ignored while the service is `auth_expired`.
    pub fn record_success(&self, service: &ServiceId) -> HealthStatus {
        let record = self.entry(service);
        let mut record = record.lock();
        if record.status == HealthStatus::AuthExpired {
            return record.status;
        }
        let now = Utc::now();
        if record.status != HealthStatus::Ok {
            info!(service = %service, from = %record.status, "service recovered");
        }
        record.status = HealthStatus::Ok;
        record.failure_count = 0;
        record.last_success = Some(now);
        record.last_attempt = Some(now);
        record.status
    }

    /// Records a failed call. Ignored while the service is `auth_expired`.
    ///
    /// The status only changes once the failure count reaches
    /// [`FAILURE_THRESHOLD`]; below that it keeps whatever it was. At the
    /// threshold an `ok` or `config_error` service becomes `degraded`.
    pub fn record_failure(&self, service: &ServiceId) -> HealthStatus {
        let record = self.entry(service);
        let mut record = record.lock();
        if record.status == HealthStatus::AuthExpired {
            return record.status;
        }
        record.failure_count = record.failure_count.saturating_add(1);
        record.last_attempt = Some(Utc::now());
        if record.failure_count >= FAILURE_THRESHOLD && record.status != HealthStatus::Degraded {
            warn!(
                service = %service,
                failures = record.failure_count,
                "service degraded"
            );
            record.status = HealthStatus::Degraded;
        }
        record.status
    }

    /// Marks the service's credentials as expired, overriding any prior state.
    pub fn record_auth_expired(&self, service: &ServiceId) -> HealthStatus {
        let record = self.entry(service);
        let mut record = record.lock();
        if record.status != HealthStatus::AuthExpired {
            warn!(service = %service, from = %record.status, "service credentials expired");
        }
        record.status = HealthStatus::AuthExpired;
        record.last_attempt = Some(Utc::now());
        record.status
    }

    /// Marks the service as misconfigured. Ignored while `auth_expired`.
    pub fn record_config_error(&self, service: &ServiceId) -> HealthStatus {
        let record = self.entry(service);
        let mut record = record.lock();
        if record.status == HealthStatus::AuthExpired {
            return record.status;
        }
        if record.status != HealthStatus::ConfigError {
            warn!(service = %service, from = %record.status, "service misconfigured");
        }
        record.status = HealthStatus::ConfigError;
        record.last_attempt = Some(Utc::now());
        record.status
    }

    /// Clears an `auth_expired` state after the operator re-authorised the service.
    pub fn reset_auth(&self, service: &ServiceId) -> HealthStatus {
        let record = self.entry(service);
        let mut record = record.lock();
        info!(service = %service, from = %record.status, "service auth reset");
        record.status = HealthStatus::Ok;
        record.failure_count = 0;
        record.last_attempt = Some(Utc::now());
        record.status
    }

    /// Returns a copy of the service's record, if it is tracked.
    #[must_use]
    pub fn record(&self, service: &ServiceId) -> Option<HealthRecord> {
        self.services
            .read()
            .get(service)
            .map(|record| record.lock().clone())
    }

    /// Returns the status of a service; untracked services report `ok`.
    #[must_use]
    pub fn status(&self, service: &ServiceId) -> HealthStatus {
        self.record(service)
            .map_or(HealthStatus::Ok, |record| record.status)
    }

    /// Returns every tracked record, ordered by service id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<HealthRecord> {
        let mut records: Vec<HealthRecord> = self
            .services
            .read()
            .values()
            .map(|record| record.lock().clone())
            .collect();
        records.sort_by(|a, b| a.service.cmp(&b.service));
        records
    }

    /// Aggregates all services into one status.
    ///
    /// Priority is `auth_expired > config_error > degraded > ok`, independent of
    /// the order services are visited in.
    #[must_use]
    pub fn overall(&self) -> HealthStatus {
        let mut overall = HealthStatus::Ok;
        for record in self.services.read().values() {
            let status = record.lock().status;
            if severity(status) > severity(overall) {
                overall = status;
            }
        }
        overall
    }
}

const fn severity(status: HealthStatus) -> u8 {
    match status {
        HealthStatus::Ok => 0,
        HealthStatus::Degraded => 1,
        HealthStatus::ConfigError => 2,
        HealthStatus::AuthExpired => 3,
    }
}

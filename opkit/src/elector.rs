//! Lease-based leader election.
//!
//! One coordination/v1 Lease per cluster acts as the lock; the holder renews
//! it on a fixed cadence and everyone else polls for expiry. Connect blocks
//! in [`Elector::acquire`] until this replica holds the lease, then races the
//! runners against [`Elector::hold`], which fails with
//! [`Error::LeaseLost`] if leadership slips away.

use chrono::Utc;
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::api::{Api, ObjectMeta, PostParams};
use std::time::Duration;

use crate::{
    error::{Error, Result},
    observe::{Level, ObsContext, Observability},
};

const LEASE_DURATION: Duration = Duration::from_secs(15);
const RENEW_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_secs(2);

pub(crate) struct Elector {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    obs: Observability,
}

impl Elector {
    pub(crate) fn new(
        client: kube::Client,
        namespace: &str,
        lease_name: &str,
        obs: Observability,
    ) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity: format!("{host}-{}", std::process::id()),
            obs,
        }
    }

    /// Block until this replica holds the lease.
    pub(crate) async fn acquire(&self, ctx: &ObsContext) -> Result<()> {
        self.obs.log(
            ctx,
            Level::Info,
            "waiting to acquire leader lease",
            &[
                ("lease", self.lease_name.clone()),
                ("identity", self.identity.clone()),
            ],
        );
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    self.obs.log(
                        ctx,
                        Level::Info,
                        "acquired leader lease",
                        &[("lease", self.lease_name.clone())],
                    );
                    return Ok(());
                }
                Ok(false) => {}
                // Contention shows up as conflicts; anything else is fatal.
                Err(err) if is_conflict(&err) => {}
                Err(source) => {
                    return Err(Error::Lease {
                        lease: self.lease_name.clone(),
                        source,
                    })
                }
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Renew the held lease until leadership is lost.
    ///
    /// Only returns with an error; the happy path renews forever.
    pub(crate) async fn hold(&self, ctx: &ObsContext) -> Result<()> {
        loop {
            tokio::time::sleep(RENEW_INTERVAL).await;
            match self.try_renew().await {
                Ok(true) => {}
                Ok(false) => {
                    self.obs.log(
                        ctx,
                        Level::Error,
                        "leader lease lost",
                        &[("lease", self.lease_name.clone())],
                    );
                    return Err(Error::LeaseLost {
                        lease: self.lease_name.clone(),
                    });
                }
                // A conflicting renewal means another holder won the race.
                Err(err) if is_conflict(&err) => {
                    return Err(Error::LeaseLost {
                        lease: self.lease_name.clone(),
                    });
                }
                Err(source) => {
                    return Err(Error::Lease {
                        lease: self.lease_name.clone(),
                        source,
                    })
                }
            }
        }
    }

    async fn try_acquire(&self) -> std::result::Result<bool, kube::Error> {
        let now = MicroTime(Utc::now());
        match self.api.get_opt(&self.lease_name).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        ..Default::default()
                    },
                    spec: Some(self.claimed_spec(now, 0)),
                };
                self.api.create(&PostParams::default(), &lease).await?;
                Ok(true)
            }
            Some(mut lease) => {
                let spec = lease.spec.clone().unwrap_or_default();
                if !self.holds(&spec) && !expired(&spec) {
                    return Ok(false);
                }
                let transitions = spec.lease_transitions.unwrap_or(0)
                    + if self.holds(&spec) { 0 } else { 1 };
                lease.spec = Some(self.claimed_spec(now, transitions));
                self.api
                    .replace(&self.lease_name, &PostParams::default(), &lease)
                    .await?;
                Ok(true)
            }
        }
    }

    async fn try_renew(&self) -> std::result::Result<bool, kube::Error> {
        let Some(mut lease) = self.api.get_opt(&self.lease_name).await? else {
            return Ok(false);
        };
        let spec = lease.spec.clone().unwrap_or_default();
        if !self.holds(&spec) {
            return Ok(false);
        }
        let mut renewed = spec;
        renewed.renew_time = Some(MicroTime(Utc::now()));
        lease.spec = Some(renewed);
        self.api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await?;
        Ok(true)
    }

    fn holds(&self, spec: &LeaseSpec) -> bool {
        spec.holder_identity.as_deref() == Some(self.identity.as_str())
    }

    fn claimed_spec(&self, now: MicroTime, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }
}

/// Whether the lease's last renewal is older than its advertised duration.
fn expired(spec: &LeaseSpec) -> bool {
    let Some(renewed) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else {
        return true;
    };
    let duration = spec
        .lease_duration_seconds
        .unwrap_or(LEASE_DURATION.as_secs() as i32);
    Utc::now() - renewed.0 > chrono::Duration::seconds(duration.into())
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::job::JobOffer;
use crate::kv::KvError;

use super::Registry;

impl Registry {
    /// Announce that a job needs a host. Idempotent: an already-open
    /// offer for the same job is left untouched.
    pub async fn create_job_offer(&self, offer: &JobOffer, ttl: Option<Duration>) -> Result<()> {
        let raw = Self::marshal(offer)?;
        match self
            .kv
            .create(&self.offer_object_path(&offer.name), &raw, ttl)
            .await
        {
            Ok(_) | Err(KvError::NodeExist(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Record this machine's claim that it can host the offered job.
    pub async fn submit_job_bid(&self, name: &str, machine: &str) -> Result<()> {
        self.kv
            .set(&self.offer_bid_path(name, machine), machine, None)
            .await?;
        Ok(())
    }

    /// Machine IDs that have bid on the offer, lexicographically ordered.
    pub async fn bids(&self, name: &str) -> Result<BTreeSet<String>> {
        let dir = match self.kv.get(&self.offer_bids_dir(name), false, true).await {
            Ok(dir) => dir,
            Err(KvError::KeyNotFound(_)) => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(dir
            .nodes
            .iter()
            .map(|n| n.base_name().to_string())
            .collect())
    }

    /// One open offer by job name, None when resolved or never opened.
    pub async fn job_offer(&self, name: &str) -> Result<Option<JobOffer>> {
        let key = self.offer_object_path(name);
        match self.kv.get(&key, false, true).await {
            Ok(node) => Ok(Some(Self::unmarshal(&key, &node.value)?)),
            Err(KvError::KeyNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All offers that have not yet been resolved.
    pub async fn unresolved_job_offers(&self) -> Result<Vec<JobOffer>> {
        let dir = match self.kv.get(&self.offer_dir(), false, true).await {
            Ok(dir) => dir,
            Err(KvError::KeyNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut offers = Vec::new();
        for node in &dir.nodes {
            let name = node.base_name().to_string();
            let key = self.offer_object_path(&name);
            let object = match self.kv.get(&key, false, true).await {
                Ok(object) => object,
                // Bids can outlive an expired offer object.
                Err(KvError::KeyNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            match Self::unmarshal::<JobOffer>(&key, &object.value) {
                Ok(offer) => offers.push(offer),
                Err(Error::BadRecord { key, source }) => {
                    tracing::warn!(%key, error = %source, "Skipping malformed offer record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(offers)
    }

    /// Retire an offer and its bid subtree after scheduling completes or
    /// the offer is abandoned.
    pub async fn resolve_job_offer(&self, name: &str) -> Result<()> {
        match self.kv.delete(&self.offer_path(name), true).await {
            Ok(_) | Err(KvError::KeyNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

//! Detached signature sets over the canonical serialization of a unit.
//!
//! Creating and verifying the actual signatures is an external
//! collaborator's job; the core only tags, stores and fetches the sets.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A tagged collection of detached signatures (base64).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureSet {
    pub tag: String,
    pub signatures: Vec<String>,
}

impl SignatureSet {
    pub fn new(tag: &str, signatures: Vec<String>) -> Self {
        Self {
            tag: tag.to_string(),
            signatures,
        }
    }

    /// Guard that this set was created for the expected tag.
    pub fn verify_tag(&self, expected: &str) -> Result<()> {
        if self.tag != expected {
            return Err(Error::SignatureMismatch {
                expected: expected.to_string(),
                actual: self.tag.clone(),
            });
        }
        Ok(())
    }
}

/// Tag identifying signatures for a job's unit.
pub fn tag_for_job(job_name: &str) -> String {
    format!("/job/{job_name}")
}

/// Tag identifying signatures for a pre-upgrade payload.
pub fn tag_for_payload(name: &str) -> String {
    format!("/payload/{name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags() {
        assert_eq!(tag_for_job("web.service"), "/job/web.service");
        assert_eq!(tag_for_payload("web.service"), "/payload/web.service");
    }

    #[test]
    fn test_verify_tag() {
        let ss = SignatureSet::new(&tag_for_job("a"), vec!["c2ln".to_string()]);
        assert!(ss.verify_tag("/job/a").is_ok());
        let err = ss.verify_tag("/job/b").unwrap_err();
        assert!(matches!(err, Error::SignatureMismatch { .. }));
    }
}

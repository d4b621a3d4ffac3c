//! Instance metadata service wrapper
//!
//! One IMDS fetch of the instance identity document yields everything
//! the pipelines need to know about where they run.

use crate::{CloudError, Result};
use serde::Deserialize;

/// Identity of the instance this process runs on
#[derive(Debug, Clone)]
pub struct InstanceIdentity {
    /// Region (us-east-1)
    pub region: String,
    /// Availability zone (us-east-1a)
    pub availability_zone: String,
    /// Instance id (i-0123456789abcdef0)
    pub instance_id: String,
    /// Owning account id
    pub account_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityDocument {
    region: String,
    availability_zone: String,
    instance_id: String,
    account_id: String,
}

/// Parse the JSON identity document IMDS serves
pub fn parse_identity_document(json: &str) -> Result<InstanceIdentity> {
    let doc: IdentityDocument =
        serde_json::from_str(json).map_err(|e| CloudError::Metadata(e.to_string()))?;
    Ok(InstanceIdentity {
        region: doc.region,
        availability_zone: doc.availability_zone,
        instance_id: doc.instance_id,
        account_id: doc.account_id,
    })
}

/// Fetch this instance's identity from IMDS.
///
/// Fatal at startup when unreachable; nothing else works without it.
pub async fn instance_identity() -> Result<InstanceIdentity> {
    let imds = aws_config::imds::Client::builder().build();
    let document: String = imds
        .get("/latest/dynamic/instance-identity/document")
        .await
        .map_err(|e| CloudError::Metadata(e.to_string()))?
        .into();
    parse_identity_document(&document)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identity_document() {
        let json = r#"{
            "accountId": "123456789012",
            "availabilityZone": "us-east-1a",
            "instanceId": "i-0abc",
            "region": "us-east-1",
            "imageId": "ami-1234"
        }"#;
        let identity = parse_identity_document(json).unwrap();
        assert_eq!(identity.region, "us-east-1");
        assert_eq!(identity.availability_zone, "us-east-1a");
        assert_eq!(identity.instance_id, "i-0abc");
        assert_eq!(identity.account_id, "123456789012");
    }

    #[test]
    fn test_parse_identity_document_rejects_garbage() {
        assert!(parse_identity_document("not json").is_err());
        assert!(parse_identity_document("{}").is_err());
    }
}

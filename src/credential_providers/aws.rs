use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_sts::config::Credentials;
use aws_sigv4::http_request::{
    self, SignableBody, SignableRequest, SignatureLocation, SigningParams, SigningSettings,
};
use aws_sigv4::sign;
use aws_smithy_runtime_api::client::identity::Identity;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use http::Request;

use super::{expand_hosted, TokenProvider, ValidationError};
use crate::token::Token;

const CLUSTER_ID_HEADER: &str = "x-k8s-aws-id";
const TOKEN_PREFIX: &str = "k8s-aws-v1.";
const ROLE_SESSION_NAME: &str = "kubecia";

// STS ignores the expires parameter server-side but requires it; older
// authenticators expect a value between 0 and 60.
const PRESIGN_EXPIRES_IN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct AwsOptions {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub cluster: String,
    pub assume_role_arn: Option<String>,
}

impl AwsOptions {
    fn assume_role_arn(&self) -> Option<&str> {
        self.assume_role_arn.as_deref().filter(|arn| !arn.is_empty())
    }

    async fn credentials(&self) -> anyhow::Result<Credentials> {
        let credentials = Credentials::new(
            self.access_key_id.clone(),
            self.secret_access_key.clone(),
            None,
            None,
            "kubecia",
        );

        let Some(assume_role_arn) = self.assume_role_arn() else {
            return Ok(credentials);
        };

        let sdkconfig = SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(SharedCredentialsProvider::new(credentials))
            .build();

        let assumed = aws_sdk_sts::Client::new(&sdkconfig)
            .assume_role()
            .role_arn(assume_role_arn)
            .role_session_name(ROLE_SESSION_NAME)
            .send()
            .await
            .context("error assuming role")?;

        let role = assumed
            .credentials()
            .context("no credentials in assume role response")?;

        Ok(Credentials::new(
            role.access_key_id(),
            role.secret_access_key(),
            Some(role.session_token().to_string()),
            SystemTime::try_from(role.expiration().to_owned()).ok(),
            "kubecia-assume-role",
        ))
    }
}

#[async_trait]
impl TokenProvider for AwsOptions {
    const NAMESPACE: &'static str = "aws";

    fn validate(&mut self) -> Result<(), ValidationError> {
        let mut hosted = expand_hosted(&mut self.access_key_id);
        if self.access_key_id.is_empty() {
            return Err(ValidationError::required(if hosted {
                "hosted access key ID"
            } else {
                "access key ID"
            }));
        }

        hosted |= expand_hosted(&mut self.secret_access_key);
        if self.secret_access_key.is_empty() {
            return Err(ValidationError::required(if hosted {
                "hosted secret access key"
            } else {
                "secret access key"
            }));
        }

        if self.region.is_empty() {
            return Err(ValidationError::required("region"));
        }

        if self.cluster.is_empty() {
            return Err(ValidationError::required("cluster ID"));
        }

        if hosted && self.assume_role_arn().is_none() {
            return Err(ValidationError::required("assume role ARN"));
        }

        Ok(())
    }

    fn cache_key(&self) -> String {
        [
            Self::NAMESPACE,
            &self.access_key_id,
            &self.region,
            &self.cluster,
            self.assume_role_arn().unwrap_or("self"),
        ]
        .join("_")
    }

    fn identity(&self) -> (&str, &str) {
        (&self.access_key_id, &self.secret_access_key)
    }

    fn route(&self) -> Vec<&str> {
        let mut route = vec![self.region.as_str(), self.cluster.as_str()];
        if let Some(assume_role_arn) = self.assume_role_arn() {
            route.push(assume_role_arn);
        }

        route
    }

    /// Presigns an STS `GetCallerIdentity` request carrying the cluster id
    /// header; the EKS webhook accepts the URL itself as proof of identity.
    async fn mint(&self) -> anyhow::Result<Token> {
        let credentials = self.credentials().await?;

        let mut settings = SigningSettings::default();
        settings.expires_in = Some(PRESIGN_EXPIRES_IN);
        settings.signature_location = SignatureLocation::QueryParams;

        let identity = Identity::from(credentials);
        let params = sign::v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name("sts")
            .time(SystemTime::now())
            .settings(settings)
            .build()
            .context("error building signing parameters")?;

        let uri = format!(
            "https://sts.{region}.amazonaws.com/?Action=GetCallerIdentity&Version=2011-06-15",
            region = self.region,
        );

        let signable = SignableRequest::new(
            "GET",
            &uri,
            std::iter::once((CLUSTER_ID_HEADER, self.cluster.as_str())),
            SignableBody::Bytes(&[]),
        )
        .context("error building signable request")?;

        let (instructions, _) = http_request::sign(signable, &SigningParams::V4(params))
            .context("error presigning request")?
            .into_parts();

        let mut request = Request::builder()
            .uri(&uri)
            .body(())
            .context("error building request")?;
        instructions.apply_to_request_http1x(&mut request);

        // STS enforces a 15 minute window from the signing timestamp no
        // matter the expires parameter; keep one minute of cushion under it.
        let expiration = Utc::now() + chrono::Duration::minutes(15) - chrono::Duration::minutes(1);

        Ok(Token {
            expiration: Some(expiration),
            value: format!(
                "{TOKEN_PREFIX}{}",
                URL_SAFE_NO_PAD.encode(request.uri().to_string()),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> AwsOptions {
        AwsOptions {
            access_key_id: "AKIAEXAMPLE".to_string(),
            secret_access_key: "secret".to_string(),
            region: "us-east-1".to_string(),
            cluster: "c1".to_string(),
            assume_role_arn: None,
        }
    }

    #[test]
    fn key_substitutes_self_without_assume_role() {
        assert_eq!(options().cache_key(), "aws_AKIAEXAMPLE_us-east-1_c1_self");

        let mut with_role = options();
        with_role.assume_role_arn = Some("arn:aws:iam::123456789012:role/admin".to_string());
        assert_eq!(
            with_role.cache_key(),
            "aws_AKIAEXAMPLE_us-east-1_c1_arn:aws:iam::123456789012:role/admin",
        );
    }

    #[test]
    fn key_ignores_the_secret() {
        let mut other = options();
        other.secret_access_key = "rotated".to_string();
        assert_eq!(options().cache_key(), other.cache_key());
    }

    #[test]
    fn route_parts() {
        assert_eq!(options().route(), vec!["us-east-1", "c1"]);

        let mut with_role = options();
        with_role.assume_role_arn = Some("arn:aws:iam::1:role/r".to_string());
        assert_eq!(
            with_role.route(),
            vec!["us-east-1", "c1", "arn:aws:iam::1:role/r"],
        );
    }

    #[test]
    fn validation_messages() {
        let mut missing_key = options();
        missing_key.access_key_id = String::new();
        assert_eq!(
            missing_key.validate().unwrap_err().to_string(),
            "access key ID is required",
        );

        let mut missing_secret = options();
        missing_secret.secret_access_key = String::new();
        assert_eq!(
            missing_secret.validate().unwrap_err().to_string(),
            "secret access key is required",
        );

        let mut missing_region = options();
        missing_region.region = String::new();
        assert_eq!(
            missing_region.validate().unwrap_err().to_string(),
            "region is required",
        );

        let mut missing_cluster = options();
        missing_cluster.cluster = String::new();
        assert_eq!(
            missing_cluster.validate().unwrap_err().to_string(),
            "cluster ID is required",
        );
    }

    #[test]
    fn hosted_mode_requires_an_assume_role() {
        std::env::set_var("KUBECIA_TEST_AWS_ACCESS_KEY_ID", "AKIAHOSTED");

        let mut hosted = options();
        hosted.access_key_id = "$KUBECIA_TEST_AWS_ACCESS_KEY_ID".to_string();
        assert_eq!(
            hosted.validate().unwrap_err().to_string(),
            "assume role ARN is required",
        );
        assert_eq!(hosted.access_key_id, "AKIAHOSTED");

        let mut hosted_unset = options();
        hosted_unset.access_key_id = "$KUBECIA_TEST_AWS_UNSET_KEY".to_string();
        assert_eq!(
            hosted_unset.validate().unwrap_err().to_string(),
            "hosted access key ID is required",
        );

        let mut hosted_with_role = options();
        hosted_with_role.access_key_id = "$KUBECIA_TEST_AWS_ACCESS_KEY_ID".to_string();
        hosted_with_role.assume_role_arn = Some("arn:aws:iam::1:role/r".to_string());
        assert!(hosted_with_role.validate().is_ok());
    }
}

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::consts;
use crate::credential_providers::aws::AwsOptions;
use crate::credential_providers::azure::AzureOptions;
use crate::credential_providers::gcp::GcpOptions;

#[derive(Parser)]
#[command(name = "kubecia", version)]
#[command(
    about = "Kubecia is a client-go credential (exec) plugin, no Cloud Provider CLI required."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve KubeCIA APIs.
    Serve {
        /// Socket path.
        #[arg(long, default_value = consts::SOCKET_PATH, env = "KUBECIA_SERVE_SOCKET")]
        socket: PathBuf,
    },

    /// Get AWS token.
    Aws(AwsArgs),

    /// Get Azure token.
    Azure(AzureArgs),

    /// Get GCP token.
    Gcp(GcpArgs),
}

#[derive(Args)]
pub struct AwsArgs {
    /// Socket path.
    #[arg(long, default_value = consts::SOCKET_PATH, env = "KUBECIA_AWS_SOCKET")]
    pub socket: PathBuf,

    /// AWS access key ID *
    #[arg(long, default_value = "", env = "KUBECIA_AWS_ACCESS_KEY_ID")]
    pub access_key_id: String,

    /// AWS secret access key *
    #[arg(long, default_value = "", env = "KUBECIA_AWS_SECRET_ACCESS_KEY")]
    pub secret_access_key: String,

    /// AWS region *
    #[arg(long, default_value = "", env = "KUBECIA_AWS_REGION")]
    pub region: String,

    /// AWS cluster ID or name *
    #[arg(long, default_value = "", env = "KUBECIA_AWS_CLUSTER")]
    pub cluster: String,

    /// AWS assume role ARN
    #[arg(long, env = "KUBECIA_AWS_ASSUME_ROLE_ARN")]
    pub assume_role_arn: Option<String>,
}

#[derive(Args)]
pub struct AzureArgs {
    /// Socket path.
    #[arg(long, default_value = consts::SOCKET_PATH, env = "KUBECIA_AZURE_SOCKET")]
    pub socket: PathBuf,

    /// Azure client ID *
    #[arg(long, default_value = "", env = "KUBECIA_AZURE_CLIENT_ID")]
    pub client_id: String,

    /// Azure client secret *
    #[arg(long, default_value = "", env = "KUBECIA_AZURE_CLIENT_SECRET")]
    pub client_secret: String,

    /// Azure tenant ID or name *
    #[arg(long, default_value = "", env = "KUBECIA_AZURE_TENANT")]
    pub tenant: String,

    /// Azure resource ID *
    #[arg(long, default_value = "", env = "KUBECIA_AZURE_RESOURCE")]
    pub resource: String,
}

#[derive(Args)]
pub struct GcpArgs {
    /// Socket path.
    #[arg(long, default_value = consts::SOCKET_PATH, env = "KUBECIA_GCP_SOCKET")]
    pub socket: PathBuf,

    /// GCP client ID *
    #[arg(long, default_value = "", env = "KUBECIA_GCP_CLIENT_ID")]
    pub client_id: String,

    /// GCP client secret *
    #[arg(long, default_value = "", env = "KUBECIA_GCP_CLIENT_SECRET")]
    pub client_secret: String,

    /// GCP region *
    #[arg(long, default_value = "", env = "KUBECIA_GCP_REGION")]
    pub region: String,

    /// GCP cluster ID or name *
    #[arg(long, default_value = "", env = "KUBECIA_GCP_CLUSTER")]
    pub cluster: String,
}

impl From<AwsArgs> for AwsOptions {
    fn from(args: AwsArgs) -> Self {
        Self {
            access_key_id: args.access_key_id,
            secret_access_key: args.secret_access_key,
            region: args.region,
            cluster: args.cluster,
            assume_role_arn: args.assume_role_arn,
        }
    }
}

impl From<AzureArgs> for AzureOptions {
    fn from(args: AzureArgs) -> Self {
        Self {
            client_id: args.client_id,
            client_secret: args.client_secret,
            tenant: args.tenant,
            resource: args.resource,
        }
    }
}

impl From<GcpArgs> for GcpOptions {
    fn from(args: GcpArgs) -> Self {
        Self {
            client_id: args.client_id,
            client_secret: args.client_secret,
            region: args.region,
            cluster: args.cluster,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_one_shot_flags() {
        let cli = Cli::try_parse_from([
            "kubecia",
            "aws",
            "--access-key-id",
            "AKIAEXAMPLE",
            "--secret-access-key",
            "secret",
            "--region",
            "us-east-1",
            "--cluster",
            "c1",
        ])
        .unwrap();

        let Commands::Aws(args) = cli.command else {
            panic!("expected the aws subcommand");
        };

        assert_eq!(args.socket.to_str(), Some(consts::SOCKET_PATH));
        assert_eq!(args.access_key_id, "AKIAEXAMPLE");
        assert_eq!(args.assume_role_arn, None);
    }

    #[test]
    fn empty_flag_values_are_accepted() {
        // Required-ness is enforced by validation, not by the parser, so a
        // missing field surfaces as a validation message instead of a
        // parser usage error.
        let cli = Cli::try_parse_from(["kubecia", "gcp", "--client-id", ""]).unwrap();

        let Commands::Gcp(args) = cli.command else {
            panic!("expected the gcp subcommand");
        };

        assert_eq!(args.client_id, "");
    }
}

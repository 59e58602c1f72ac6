//! Check command - bind to each domain and read its rootDSE

use clap::Args;
use std::sync::Arc;

use dirsync_connector::traits::DirectoryClient;
use dirsync_connector_ldap::LdapDirectoryClient;

use crate::config::load_domain_from_env;
use crate::error::CliResult;
use crate::output::{write_server_info, OutputFormat};

/// Arguments for the check command
#[derive(Args, Debug)]
#[command(about = "Verify connectivity and credentials for a domain")]
pub struct CheckArgs {
    /// Domain to check (repeatable)
    #[arg(long = "domain", short = 'd', required = true)]
    pub domains: Vec<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Execute the check command
pub async fn execute(args: CheckArgs) -> CliResult<()> {
    let client: Arc<dyn DirectoryClient> = Arc::new(LdapDirectoryClient::new());

    for domain in &args.domains {
        let source = load_domain_from_env(domain)?;
        source.ldap.connection.validate()?;

        let info = super::probe(client.as_ref(), &source.ldap.connection).await?;
        write_server_info(&mut std::io::stdout().lock(), domain, &info, args.format)?;
    }

    Ok(())
}

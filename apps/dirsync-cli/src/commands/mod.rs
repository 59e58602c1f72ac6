//! CLI command implementations

pub mod check;
pub mod sync;

use tracing::warn;

use dirsync_connector::config::ConnectionConfig;
use dirsync_connector::traits::{DirectoryClient, ServerInfo};

use crate::error::CliResult;

/// Bind, read the rootDSE and release the connection.
pub async fn probe(
    client: &dyn DirectoryClient,
    connection: &ConnectionConfig,
) -> CliResult<ServerInfo> {
    let mut conn = client.connect(connection).await?;
    let info = conn.server_info().await;
    if let Err(e) = conn.close().await {
        warn!(error = %e, "Failed to close probe connection");
    }
    Ok(info?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_engine::memory::InMemoryDirectory;

    fn source(vars: &[(&str, &str)]) -> crate::config::DomainSource {
        crate::config::load_domain("corp", |k| {
            vars.iter()
                .find(|(name, _)| *name == k)
                .map(|(_, v)| v.to_string())
        })
        .unwrap()
    }

    const VARS: [(&str, &str); 3] = [
        ("AD_CORP_HOST", "dc01"),
        ("AD_CORP_USER", "svc"),
        ("AD_CORP_PASSWORD", "pw"),
    ];

    #[tokio::test]
    async fn test_root_dse_read_closes_connection() {
        let directory = InMemoryDirectory::new().with_naming_context("DC=corp,DC=example");
        let source = source(&VARS);

        let info = probe(&directory, &source.ldap.connection).await.unwrap();

        assert_eq!(info.default_naming_context.as_deref(), Some("DC=corp,DC=example"));
        assert_eq!(directory.connect_count(), 1);
        assert_eq!(directory.close_count(), 1);
    }

    #[tokio::test]
    async fn test_root_dse_read_reports_bind_failure() {
        let directory = InMemoryDirectory::new();
        directory.reject_bind(true);
        let source = source(&VARS);

        let err = probe(&directory, &source.ldap.connection).await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}

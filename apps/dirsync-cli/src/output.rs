//! Run summary output.

use clap::ValueEnum;
use std::io::Write;

use dirsync_connector::traits::ServerInfo;
use dirsync_engine::summary::RunSummary;

use crate::error::CliResult;

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// JSON document
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Write run summaries.
pub fn write_summaries<W: Write>(
    out: &mut W,
    summaries: &[RunSummary],
    format: OutputFormat,
) -> CliResult<()> {
    match format {
        OutputFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, summaries)?;
            writeln!(out)?;
        }
        OutputFormat::Text => {
            for summary in summaries {
                writeln!(out, "{}", summary.describe())?;
                for skip in &summary.skipped {
                    writeln!(
                        out,
                        "  skipped {} ({}): {}",
                        skip.dn, skip.phase, skip.message
                    )?;
                }
                if let Some(watermark) = &summary.watermark {
                    writeln!(out, "  watermark {}", watermark.to_rfc3339())?;
                }
            }
        }
    }
    Ok(())
}

/// Write the result of a connectivity check.
pub fn write_server_info<W: Write>(
    out: &mut W,
    domain: &str,
    info: &ServerInfo,
    format: OutputFormat,
) -> CliResult<()> {
    match format {
        OutputFormat::Json => {
            let doc = serde_json::json!({ "domain": domain, "server": info });
            serde_json::to_writer_pretty(&mut *out, &doc)?;
            writeln!(out)?;
        }
        OutputFormat::Text => {
            let or_unknown = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
            writeln!(out, "{}: bind ok", domain)?;
            writeln!(out, "  host            {}", or_unknown(&info.dns_host_name))?;
            writeln!(
                out,
                "  naming context  {}",
                or_unknown(&info.default_naming_context)
            )?;
            writeln!(
                out,
                "  highest USN     {}",
                or_unknown(&info.highest_committed_usn)
            )?;
            writeln!(
                out,
                "  LDAP versions   {}",
                info.supported_ldap_versions.join(", ")
            )?;
        }
    }
    Ok(())
}

// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command-line interface.
//
// Flags override the configuration file; ad-hoc directives injected with
// `-o` are applied after the file, in order.

use std::path::PathBuf;

use clap::Parser;
use tracing::warn;

use druckwerk_core::error::{DruckwerkError, Result};
use druckwerk_core::Config;

#[derive(Debug, Parser)]
#[command(
    name = "druckwerkd",
    version,
    about = "Discovers network printers and reconciles local print queues"
)]
pub struct Cli {
    /// Configuration file.
    #[arg(short = 'c', long, default_value = "/etc/druckwerk/druckwerkd.conf")]
    pub config: PathBuf,

    /// Verbose logging to stderr.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Append log output to this file instead of stderr.
    #[arg(short = 'l', long)]
    pub logfile: Option<PathBuf>,

    /// Inject a configuration directive (repeatable), e.g.
    /// -o "BrowsePoll server:631".
    #[arg(short = 'o', long = "option", value_name = "DIRECTIVE")]
    pub directives: Vec<String>,

    /// Override the cache directory.
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Auto-shutdown mode: on, off, or avahi.
    #[arg(long, value_name = "MODE")]
    pub autoshutdown: Option<String>,

    /// Auto-shutdown timeout in seconds.
    #[arg(long, value_name = "SECS")]
    pub autoshutdown_timeout: Option<u64>,

    /// Auto-shutdown trigger: no-queues or no-jobs.
    #[arg(long, value_name = "TRIGGER")]
    pub autoshutdown_on: Option<String>,

    /// Local scheduler endpoint.
    #[arg(long, default_value = "ipp://localhost:631", value_name = "URI")]
    pub cups_server: String,

    /// Override the hostname used for self-announcement filtering.
    #[arg(long)]
    pub hostname: Option<String>,
}

impl Cli {
    /// Assemble the effective configuration.
    ///
    /// A missing configuration file is fine (defaults apply); an unreadable
    /// one and malformed command-line flags are fatal.
    pub fn build_config(&self) -> Result<Config> {
        let mut config = if self.config.exists() {
            Config::load_file(&self.config)?
        } else {
            warn!(path = %self.config.display(), "no configuration file, using defaults");
            Config::default()
        };

        for directive in &self.directives {
            // Unlike file directives, a broken -o aborts startup.
            config
                .apply_directive(directive)
                .map_err(|e| DruckwerkError::Config(format!("-o {directive}: {e}")))?;
        }

        if let Some(mode) = &self.autoshutdown {
            config.apply_directive(&format!("AutoShutdown {mode}"))?;
        }
        if let Some(timeout) = self.autoshutdown_timeout {
            config.apply_directive(&format!("AutoShutdownTimeout {timeout}"))?;
        }
        if let Some(trigger) = &self.autoshutdown_on {
            config.apply_directive(&format!("AutoShutdownOn {trigger}"))?;
        }
        if let Some(dir) = &self.cache_dir {
            config.cache_dir = dir.clone();
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["druckwerkd"]);
        assert!(!cli.debug);
        assert_eq!(cli.cups_server, "ipp://localhost:631");
        let config = cli.build_config().unwrap();
        assert!(config.browse_dnssd);
    }

    #[test]
    fn injected_directives_apply_in_order() {
        let cli = Cli::parse_from([
            "druckwerkd",
            "-o",
            "BrowseInterval 120",
            "-o",
            "AutoClustering No",
        ]);
        let config = cli.build_config().unwrap();
        assert_eq!(config.browse_interval_secs, 120);
        assert!(!config.auto_clustering);
    }

    #[test]
    fn bad_injected_directive_is_fatal() {
        let cli = Cli::parse_from(["druckwerkd", "-o", "NoSuchThing 1"]);
        assert!(cli.build_config().is_err());
    }

    #[test]
    fn autoshutdown_flags_override() {
        let cli = Cli::parse_from([
            "druckwerkd",
            "--autoshutdown",
            "avahi",
            "--autoshutdown-timeout",
            "45",
            "--autoshutdown-on",
            "no-jobs",
        ]);
        let config = cli.build_config().unwrap();
        assert!(config.autoshutdown.enabled);
        assert!(config.autoshutdown.avahi_bound);
        assert_eq!(config.autoshutdown.timeout_secs, 45);
    }

    #[test]
    fn cache_dir_override() {
        let cli = Cli::parse_from(["druckwerkd", "--cache-dir", "/tmp/dw-test"]);
        let config = cli.build_config().unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/tmp/dw-test"));
    }
}

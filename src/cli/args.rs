// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use kubemcp::config::{ConfigSources, base_dir};

#[derive(Parser, Debug)]
#[command(name = "kubemcp")]
#[command(author, version, about = "Access-controlled multi-cluster Kubernetes gateway")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Primary configuration file (defaults to ~/.kubemcp/config.toml when present)
    #[arg(long, env = "KUBEMCP_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Drop-in directory merged after the primary file, in name order
    #[arg(long, value_name = "DIR")]
    pub config_dir: Option<PathBuf>,

    /// Kubeconfig to use instead of $KUBECONFIG / ~/.kube/config
    #[arg(long, value_name = "FILE")]
    pub kubeconfig: Option<PathBuf>,

    /// Default context (kubeconfig current-context otherwise)
    #[arg(short, long, value_name = "CONTEXT")]
    pub context: Option<String>,

    /// Increase log verbosity (-v, -vv, ...); overrides log_level
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Also write logs to ~/.kubemcp/log/kubemcp.log
    #[arg(long)]
    pub log_file: bool,

    /// Expose only read-only operations
    #[arg(long)]
    pub read_only: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway until interrupted, reloading on SIGHUP and file changes
    Serve,

    /// List the contexts the gateway can use
    Contexts,

    /// Resolve a kind to its resource through the filtered mapper
    Resolve {
        /// apiVersion, e.g. "v1" or "apps/v1"
        api_version: String,
        kind: String,
    },

    /// Check whether the current identity may perform an action
    CanI {
        verb: String,
        /// Plural resource name, e.g. "pods"
        resource: String,
        #[arg(short, long, default_value = "")]
        group: String,
        #[arg(short, long)]
        namespace: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },

    /// Print the merged configuration
    Config,

    /// Print the operations the configuration exposes
    Operations,
}

impl Args {
    /// Configuration sources with command-line flags applied as overrides
    pub fn config_sources(&self) -> ConfigSources {
        let primary = self.config.clone().or_else(|| {
            base_dir()
                .ok()
                .map(|dir| dir.join("config.toml"))
                .filter(|path| path.exists())
        });

        let mut sources = ConfigSources::new(primary, self.config_dir.clone());
        if let Some(kubeconfig) = &self.kubeconfig {
            sources = sources.with_override("kubeconfig", kubeconfig.display().to_string());
        }
        if self.verbose > 0 {
            let level = self.verbose.saturating_mul(2).min(9);
            sources = sources.with_override("log_level", i64::from(level));
        }
        if self.read_only {
            sources = sources.with_override("read_only", true);
        }
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let args = Args::try_parse_from(["kubemcp"]).unwrap();
        assert!(args.command.is_none());
        assert_eq!(args.verbose, 0);
        assert!(args.context.is_none());
    }

    #[test]
    fn test_parse_can_i() {
        let args = Args::try_parse_from([
            "kubemcp", "-c", "prod", "can-i", "list", "deployments", "-g", "apps", "-n", "web",
        ])
        .unwrap();
        assert_eq!(args.context.as_deref(), Some("prod"));
        match args.command {
            Some(Command::CanI {
                verb,
                resource,
                group,
                namespace,
                name,
            }) => {
                assert_eq!(verb, "list");
                assert_eq!(resource, "deployments");
                assert_eq!(group, "apps");
                assert_eq!(namespace.as_deref(), Some("web"));
                assert!(name.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_flags_become_overrides() {
        let args = Args::try_parse_from([
            "kubemcp",
            "--config",
            "/etc/kubemcp/config.toml",
            "--kubeconfig",
            "/tmp/kc",
            "-vv",
            "--read-only",
        ])
        .unwrap();
        let sources = args.config_sources();
        assert_eq!(
            sources.drop_in_dir.as_deref(),
            Some(std::path::Path::new("/etc/kubemcp/conf.d"))
        );
        assert_eq!(sources.overrides["kubeconfig"].as_str(), Some("/tmp/kc"));
        assert_eq!(sources.overrides["log_level"].as_integer(), Some(4));
        assert_eq!(sources.overrides["read_only"].as_bool(), Some(true));
    }
}

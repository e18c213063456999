//! Command-line surface and the resolved per-command configuration.

use crate::build_log::Verbosity;
use crate::constants::DEFAULT_REPORT_PORT;
use crate::rule::ROOT_MODULE;
use crate::stage::Command;
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "anvil", version, about = "Content-pipeline build tool")]
pub struct Cli {
    /// Emit diagnostics as JSON
    #[arg(long, global = true, env = "ANVIL_LOG_JSON")]
    pub log_json: bool,

    /// Enable debug diagnostics
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub enum CliCommand {
    /// Build the given targets
    Build(BuildArgs),
    /// Build, then run test rules
    Test(BuildArgs),
    /// Remove outputs; everything when no target is given
    Clean(BuildArgs),
    /// Clean, then build
    Rebuild(BuildArgs),
    /// Build, then copy target outputs to a deploy directory
    Deploy(DeployArgs),
    /// Run the build report server
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    /// Rule references such as `/module:rule` or `:rule`
    pub targets: Vec<String>,

    /// Project root
    #[arg(long, default_value = ".")]
    pub root: PathBuf,

    /// Maximum number of rules running at once
    #[arg(short, long, env = "ANVIL_JOBS")]
    pub jobs: Option<usize>,

    /// Ignore the rule cache
    #[arg(short, long)]
    pub force: bool,

    /// Build log detail
    #[arg(long, value_enum, default_value_t = LogDetail::Normal)]
    pub log_detail: LogDetail,

    /// Build report server to stream progress to
    #[arg(long, env = "ANVIL_REPORT_URL")]
    pub report_url: Option<String>,

    /// Rule cache directory
    #[arg(long, env = "ANVIL_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Write the build log as JSON lines
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct DeployArgs {
    #[command(flatten)]
    pub build: BuildArgs,

    /// Destination for deployed outputs
    #[arg(long)]
    pub deploy_dir: PathBuf,

    /// Empty the deploy directory before copying
    #[arg(long)]
    pub clean: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, default_value_t = DEFAULT_REPORT_PORT)]
    pub port: u16,

    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub bind: IpAddr,

    #[arg(long, default_value = ".anvil-reports")]
    pub data_dir: PathBuf,
}

impl ServeArgs {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogDetail {
    Silent,
    Normal,
    Verbose,
}

impl From<LogDetail> for Verbosity {
    fn from(detail: LogDetail) -> Self {
        match detail {
            LogDetail::Silent => Verbosity::Silent,
            LogDetail::Normal => Verbosity::Normal,
            LogDetail::Verbose => Verbosity::Verbose,
        }
    }
}

/// Configuration for one build command after defaults were applied.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub command: Command,
    pub targets: Vec<String>,
    pub root_path: PathBuf,
    pub jobs: usize,
    pub force: bool,
    pub verbosity: Verbosity,
    pub report_url: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub deploy_dir: Option<PathBuf>,
    /// Remove `deploy_dir` before the deploy stage copies into it
    pub clean_deploy: bool,
    pub log_file: Option<PathBuf>,
    /// Module that `:name` targets refer to
    pub requesting_module: String,
}

impl BuildConfig {
    pub fn from_args(command: Command, args: BuildArgs, deploy_dir: Option<PathBuf>) -> Result<Self> {
        if args.targets.is_empty() && command != Command::Clean {
            bail!("{} needs at least one target", command.name());
        }
        let root_path = args
            .root
            .canonicalize()
            .with_context(|| format!("Project root {} not found", args.root.display()))?;
        let cwd = std::env::current_dir().context("Current directory is not accessible")?;
        let requesting_module = module_for_dir(&root_path, &cwd);

        Ok(Self {
            command,
            targets: args.targets,
            root_path,
            jobs: args.jobs.unwrap_or_else(default_jobs).max(1),
            force: args.force,
            verbosity: args.log_detail.into(),
            report_url: args.report_url,
            cache_dir: args.cache_dir,
            deploy_dir,
            clean_deploy: false,
            log_file: args.log_file,
            requesting_module,
        })
    }
}

impl CliCommand {
    /// Splits a build-type command into its configuration. `None` for
    /// `serve`.
    pub fn into_build_config(self) -> Result<Option<BuildConfig>> {
        let config = match self {
            Self::Build(args) => BuildConfig::from_args(Command::Build, args, None)?,
            Self::Test(args) => BuildConfig::from_args(Command::Test, args, None)?,
            Self::Clean(args) => BuildConfig::from_args(Command::Clean, args, None)?,
            Self::Rebuild(args) => BuildConfig::from_args(Command::Rebuild, args, None)?,
            Self::Deploy(args) => {
                let mut config =
                    BuildConfig::from_args(Command::Deploy, args.build, Some(args.deploy_dir))?;
                config.clean_deploy = args.clean;
                config
            }
            Self::Serve(_) => return Ok(None),
        };
        Ok(Some(config))
    }
}

pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Module path of `dir` inside the project; the root module when `dir` is
/// outside it.
pub fn module_for_dir(root: &Path, dir: &Path) -> String {
    let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
    match dir.strip_prefix(root) {
        Ok(rel) if rel.as_os_str().is_empty() => ROOT_MODULE.to_string(),
        Ok(rel) => {
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            format!("/{}", parts.join("/"))
        }
        Err(_) => ROOT_MODULE.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_build_command() {
        let cli = Cli::try_parse_from(["anvil", "build", ":all", "-j", "3", "--force"]).unwrap();
        let CliCommand::Build(args) = cli.command else {
            panic!("expected build");
        };
        assert_eq!(args.targets, vec![":all"]);
        assert_eq!(args.jobs, Some(3));
        assert!(args.force);
    }

    #[test]
    fn test_deploy_requires_dir() {
        assert!(Cli::try_parse_from(["anvil", "deploy", ":app"]).is_err());
        let cli =
            Cli::try_parse_from(["anvil", "deploy", ":app", "--deploy-dir", "/tmp/out"]).unwrap();
        let CliCommand::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        assert!(!args.clean);

        let cli = Cli::try_parse_from([
            "anvil",
            "deploy",
            ":app",
            "--deploy-dir",
            "/tmp/out",
            "--clean",
        ])
        .unwrap();
        let CliCommand::Deploy(args) = cli.command else {
            panic!("expected deploy");
        };
        assert!(args.clean);
    }

    #[test]
    fn test_build_config_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from([
            "anvil",
            "rebuild",
            "/a:b",
            "--root",
            dir.path().to_str().unwrap(),
            "--jobs",
            "0",
        ])
        .unwrap();
        let config = cli.command.into_build_config().unwrap().unwrap();
        assert_eq!(config.command, Command::Rebuild);
        assert_eq!(config.jobs, 1);
        assert_eq!(config.verbosity, Verbosity::Normal);
    }

    #[test]
    fn test_build_without_targets_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let args = BuildArgs {
            targets: Vec::new(),
            root: dir.path().to_path_buf(),
            jobs: None,
            force: false,
            log_detail: LogDetail::Normal,
            report_url: None,
            cache_dir: None,
            log_file: None,
        };
        assert!(BuildConfig::from_args(Command::Build, args.clone(), None).is_err());
        assert!(BuildConfig::from_args(Command::Clean, args, None).is_ok());
    }

    #[test]
    fn test_module_for_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let sub = root.join("assets").join("ui");
        std::fs::create_dir_all(&sub).unwrap();
        assert_eq!(module_for_dir(&root, &root), "/");
        assert_eq!(module_for_dir(&root, &sub), "/assets/ui");
        assert_eq!(module_for_dir(&root, Path::new("/")), "/");
    }
}

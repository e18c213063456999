use anvil::build_log::{ConsoleSink, FileSink, LogSource};
use anvil::cache::FileCache;
use anvil::config::{BuildConfig, Cli, CliCommand};
use anvil::context::BuildEnv;
use anvil::error::RetryConfig;
use anvil::graph::GraphPayload;
use anvil::loader::FileModuleLoader;
use anvil::report::{RemoteSink, ReportClient, ReportRequest, ReportTransport};
use anvil::rules::RuleTypeRegistry;
use anvil::session::BuildSession;
use anvil::stage::{Command, StageManager, StageSpec};
use anvil::{logging, server};
use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.log_json, cli.verbose)?;

    if let CliCommand::Serve(args) = &cli.command {
        return server::start_server(args.addr(), args.data_dir.clone()).await;
    }

    let Some(config) = cli.command.into_build_config()? else {
        return Ok(());
    };
    let code = run(config).await?;
    std::process::exit(code);
}

async fn run(config: BuildConfig) -> Result<i32> {
    let mut env = BuildEnv::new(&config.root_path);
    if let Some(dir) = &config.cache_dir {
        env = env.with_cache_dir(dir);
    }
    let env = Arc::new(env);

    if config.command == Command::Clean && config.targets.is_empty() {
        env.clean_all()?;
        println!(
            "{} outputs and cache under {}",
            "Removed".green(),
            env.root_path().display()
        );
        return Ok(0);
    }

    let registry = Arc::new(RuleTypeRegistry::with_builtins());
    let loader = Arc::new(FileModuleLoader::new(env.root_path(), registry.clone()));
    let cache = Arc::new(FileCache::open(env.cache_dir())?);
    let session = Arc::new(
        BuildSession::new(env.clone(), loader, registry, cache)
            .with_targets(config.targets.clone())
            .with_jobs(config.jobs)
            .with_force(config.force)
            .with_requesting_module(Some(config.requesting_module.clone()))
            .with_deploy_dir(config.deploy_dir.clone())
            .with_clean_deploy(config.clean_deploy),
    );
    tracing::debug!(session = %session.id, jobs = session.jobs, "Session ready");

    let command = config.command;
    let stages = command.stages();
    let root_log = LogSource::root(command.name());
    root_log.set_verbosity(config.verbosity);
    root_log.add_sink(Arc::new(ConsoleSink::new()));

    let file_sink = match &config.log_file {
        Some(path) => {
            let sink = Arc::new(
                FileSink::create(path)
                    .with_context(|| format!("Cannot write build log {}", path.display()))?,
            );
            root_log.add_sink(sink.clone());
            Some(sink)
        }
        None => None,
    };
    let remote_sink = match &config.report_url {
        Some(url) => attach_report(url, &session, command, &stages, &root_log).await,
        None => None,
    };

    let outcome = StageManager::new(session, root_log).run(&stages).await;

    if let Some(sink) = remote_sink {
        sink.flush().await;
    }
    if let Some(sink) = file_sink {
        sink.flush()?;
    }

    let summary = format!("{} {}", command.name(), outcome.result);
    if outcome.exit_code() == 0 {
        println!("{}", summary.green().bold());
    } else {
        println!("{}", summary.red().bold());
    }
    Ok(outcome.exit_code())
}

/// Creates the remote report and attaches a sink streaming to it. A report
/// server that cannot be reached only costs the remote view.
async fn attach_report(
    url: &str,
    session: &BuildSession,
    command: Command,
    stages: &[StageSpec],
    root_log: &Arc<LogSource>,
) -> Option<Arc<RemoteSink>> {
    let graph = match session.build_graph() {
        Ok(graph) => graph.to_payload(),
        Err(e) => {
            tracing::warn!(error = %e, "Reporting without a dependency graph");
            GraphPayload {
                nodes: Vec::new(),
                edges: Vec::new(),
            }
        }
    };
    let command_line = std::env::args().collect::<Vec<_>>().join(" ");
    let request = ReportRequest::for_session(
        session,
        command.name(),
        stages.iter().map(|s| s.name.clone()).collect(),
        graph,
        command_line,
    );

    let client = match ReportClient::new(url) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            tracing::warn!(url, error = %e, "Build report disabled");
            return None;
        }
    };
    match client.create_report(&request).await {
        Ok(id) => {
            let sink = RemoteSink::spawn(client, id, RetryConfig::default());
            root_log.add_sink(sink.clone());
            Some(sink)
        }
        Err(e) => {
            tracing::warn!(url, error = %e, "Build report server unavailable");
            None
        }
    }
}

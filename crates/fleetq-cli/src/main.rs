mod handlers;
mod server;

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fleetq::controller::RemoteDrain;
use fleetq::functions::{function_details, list_functions, STATE_QUEUE_VARIABLE};
use fleetq::logs::recent_logs;
use fleetq::packages::{
    list_packages, list_redeploy_targets, plan_redeploys, redeploy, PackageSource,
    DEFAULT_FUNCTION_PROFILE, DEFAULT_PACKAGE_PROFILE, PACKAGE_REGION,
};
use fleetq::profiles::{self, DEFAULT_PROFILE};
use fleetq::{
    list_queues, probe_status, ClientProvider, ClientSettings, DrainRequest, DrainSettings,
    Drainer, ProgressReporter, DEFAULT_REGION,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

const LOCAL_ENDPOINT: &str = "http://localhost:4566";

#[tokio::main]
pub async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = Cli::parse().run().await {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

#[derive(Debug, Parser)]
#[command(name = "fleetq")]
#[command(about = "drain SQS queues and manage the Lambda collectors they feed", long_about = None)]
pub struct Cli {
    /// Named AWS credential profile
    #[arg(long, global = true, env = "FLEETQ_PROFILE", default_value = DEFAULT_PROFILE)]
    profile: String,

    #[arg(long, global = true, env = "FLEETQ_REGION", default_value = DEFAULT_REGION)]
    region: String,

    /// Use static test credentials, e.g. against LocalStack
    #[arg(long, global = true)]
    local: bool,

    /// Override the AWS endpoint (defaults to LocalStack with --local)
    #[arg(long, global = true, env = "FLEETQ_ENDPOINT")]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List queue URLs in the region
    List,
    /// Show approximate message counts of a queue
    Status { url: String },
    /// Read what is sitting in a queue without deleting anything
    Drain {
        #[arg(required_unless_present = "function", conflicts_with = "function")]
        url: Option<String>,

        /// Drain the state queue named by this function's environment
        #[arg(long)]
        function: Option<String>,

        /// Drain through a running `fleetq serve` instead of in-process
        #[arg(long)]
        server: Option<String>,

        /// Remote drains to run, merging messages across them
        #[arg(long, default_value_t = 1, requires = "server", value_parser = clap::value_parser!(u32).range(1..))]
        rounds: u32,
    },
    /// List functions, or show one function's configuration or logs
    Functions {
        #[arg(long)]
        name: Option<String>,

        /// Recent log events instead of configuration
        #[arg(long, requires = "name")]
        logs: bool,
    },
    /// List credential profiles found in ~/.aws
    Profiles,
    /// Point collectors at the package matching their recorded zip file
    Redeploy {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        name: Option<String>,

        /// Every collector function
        #[arg(long)]
        all: bool,

        /// Show the matches without updating anything
        #[arg(long)]
        dry_run: bool,

        /// Profile that can read the package bucket
        #[arg(long, env = "FLEETQ_PACKAGE_PROFILE", default_value = DEFAULT_PACKAGE_PROFILE)]
        package_profile: String,

        /// Profile that can update the functions
        #[arg(long, env = "FLEETQ_FUNCTION_PROFILE", default_value = DEFAULT_FUNCTION_PROFILE)]
        function_profile: String,
    },
    /// Serve the dashboard API
    Serve {
        #[arg(long, env = "FLEETQ_HOST", default_value = "127.0.0.1")]
        host: String,

        #[arg(long, env = "FLEETQ_PORT", default_value_t = 3000)]
        port: u16,
    },
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        let clients = ClientProvider::new(self.client_settings());

        match &self.command {
            Commands::List => {
                let sqs = clients.sqs(&self.profile, &self.region).await;
                for url in list_queues(&sqs).await? {
                    println!("{url}");
                }
            }
            Commands::Status { url } => {
                let sqs = clients.sqs(&self.profile, &self.region).await;
                let status = probe_status(&sqs, url, &DrainSettings::default().probe).await?;
                print_json(&status)?;
            }
            Commands::Drain {
                url,
                function,
                server,
                rounds,
            } => {
                let queue_url = self
                    .resolve_queue_url(&clients, url.as_deref(), function.as_deref())
                    .await?;
                let request = DrainRequest {
                    profile: self.profile.clone(),
                    region: self.region.clone(),
                    queue_url,
                };
                match server {
                    Some(server) => drain_remote(server, &request, *rounds).await?,
                    None => drain_local(&clients, &request).await?,
                }
            }
            Commands::Functions { name: None, .. } => {
                let lambda = clients.lambda(&self.profile, &self.region).await;
                print_json(&list_functions(&lambda).await?)?;
            }
            Commands::Functions {
                name: Some(name),
                logs: true,
            } => {
                let logs = clients.logs(&self.profile, &self.region).await;
                print_json(&recent_logs(&logs, name).await?)?;
            }
            Commands::Functions {
                name: Some(name),
                logs: false,
            } => {
                let lambda = clients.lambda(&self.profile, &self.region).await;
                let sqs = clients.sqs(&self.profile, &self.region).await;
                print_json(&function_details(&lambda, &sqs, &self.region, name).await?)?;
            }
            Commands::Profiles => print_json(&profiles::discover())?,
            Commands::Redeploy {
                name,
                dry_run,
                package_profile,
                function_profile,
                ..
            } => {
                let profiles = (package_profile.as_str(), function_profile.as_str());
                redeploy_collectors(&clients, profiles, name.as_deref(), *dry_run).await?;
            }
            Commands::Serve { host, port } => {
                let state = server::AppState::new(clients, DrainSettings::default());
                server::serve(state, host, *port).await?;
            }
        }

        Ok(())
    }

    fn client_settings(&self) -> ClientSettings {
        match (&self.endpoint, self.local) {
            (Some(endpoint), true) => ClientSettings::local(endpoint),
            (None, true) => ClientSettings::local(LOCAL_ENDPOINT),
            (Some(endpoint), false) => ClientSettings {
                endpoint_url: Some(endpoint.clone()),
                ..ClientSettings::default()
            },
            (None, false) => ClientSettings::default(),
        }
    }

    async fn resolve_queue_url(
        &self,
        clients: &ClientProvider,
        url: Option<&str>,
        function: Option<&str>,
    ) -> anyhow::Result<String> {
        if let Some(url) = url.filter(|u| !u.is_empty()) {
            return Ok(url.to_string());
        }
        let name = function.context("Missing queue URL")?;

        let lambda = clients.lambda(&self.profile, &self.region).await;
        let sqs = clients.sqs(&self.profile, &self.region).await;
        let details = function_details(&lambda, &sqs, &self.region, name).await?;
        details
            .config
            .state_queue_url()
            .map(str::to_string)
            .with_context(|| format!("{name} has no {STATE_QUEUE_VARIABLE} variable"))
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Runs a drain in this process, showing progress until it returns.
///
/// Ctrl-C cancels the drain; whatever was received is still printed.
async fn drain_local(clients: &ClientProvider, request: &DrainRequest) -> anyhow::Result<()> {
    let sqs = clients.sqs(&request.profile, &request.region).await;
    let drainer = Drainer::new(sqs);
    let cancel = CancellationToken::new();
    let (reporter, mut progress) = ProgressReporter::channel();

    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
    bar.enable_steady_tick(Duration::from_millis(100));

    let watcher = tokio::spawn({
        let bar = bar.clone();
        async move {
            while progress.changed().await.is_ok() {
                let p = *progress.borrow_and_update();
                bar.set_message(format!(
                    "{} | poll {} | {:.1}s",
                    p.strategy,
                    p.poll_count,
                    p.time_elapsed_ms as f64 / 1000.0
                ));
            }
        }
    });

    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let outcome = drainer.drain(request, &cancel, reporter).await;
    interrupt.abort();
    watcher.abort();
    bar.finish_and_clear();

    match outcome {
        Ok(result) => print_json(&result),
        Err(failure) => {
            print_json(&failure)?;
            Err(anyhow::Error::new(failure).context("drain failed"))
        }
    }
}

/// Drains through a running server, `rounds` times, merging messages.
async fn drain_remote(server: &str, request: &DrainRequest, rounds: u32) -> anyhow::Result<()> {
    let remote = RemoteDrain::new(server);
    let mut seen = Vec::new();
    let mut last = None;

    for round in 1..=rounds {
        let result = remote
            .drain(request, &mut seen)
            .await
            .with_context(|| format!("remote drain via {server} failed"))?;
        log::info!(
            "round {round}/{rounds}: {} messages so far ({})",
            result.messages.len(),
            result.strategy
        );
        last = Some(result);
    }

    match last {
        Some(result) => print_json(&result),
        None => Ok(()),
    }
}

/// Redeploys `name`, or every collector, from its matching package.
///
/// Functions without a matching package are skipped and reported.
async fn redeploy_collectors(
    clients: &ClientProvider,
    (package_profile, function_profile): (&str, &str),
    name: Option<&str>,
    dry_run: bool,
) -> anyhow::Result<()> {
    let s3 = clients.s3(package_profile, PACKAGE_REGION).await;
    let lambda = clients.lambda(function_profile, PACKAGE_REGION).await;
    let source = PackageSource::default();
    let (packages, targets) =
        tokio::try_join!(list_packages(&s3, &source), list_redeploy_targets(&lambda))?;

    let plan = plan_redeploys(&targets, &packages, name);
    if let Some(name) = name {
        anyhow::ensure!(!plan.is_empty(), "{name} is not a collector function");
    }
    if dry_run {
        return print_json(&plan);
    }

    for step in &plan {
        match &step.package {
            Some(key) => println!("{}", redeploy(&lambda, &step.function_name, &source, key).await?),
            None => log::warn!("no package matches {}, skipped", step.function_name),
        }
    }
    Ok(())
}

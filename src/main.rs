use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewarden::admission::{AdmissionCoordinator, Decision};
use ratewarden::config::{process_env, WardenConfig};
use ratewarden::ratelimit::{PolicyHint, PolicyType, RequestContext};

#[derive(Parser, Debug)]
#[command(name = "ratewarden", version, about = "Request admission control")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run admission decisions in-process and print each outcome
    Check(CheckArgs),
    /// Print the effective limit for an endpoint
    Resolve {
        #[arg(long)]
        endpoint: String,
        #[arg(long, default_value_t = 0)]
        limit: u64,
        #[arg(long, default_value_t = 0)]
        window: u64,
    },
    /// Issue an API key and print its record
    IssueKey {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        limit: u64,
        #[arg(long)]
        window: u64,
        /// Zero issues a key that never expires
        #[arg(long, default_value_t = 0)]
        expiry_days: u32,
    },
}

#[derive(Args, Debug)]
struct CheckArgs {
    #[arg(long)]
    ip: String,
    #[arg(long)]
    endpoint: String,
    #[arg(long, default_value = "ip-based")]
    policy: PolicyType,
    #[arg(long)]
    method: Option<String>,
    #[arg(long)]
    user: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    /// Route limit; zero defers to configuration
    #[arg(long, default_value_t = 0)]
    limit: u64,
    /// Route window in seconds; zero defers to configuration
    #[arg(long, default_value_t = 0)]
    window: u64,
    /// Number of requests to run
    #[arg(long, default_value_t = 1)]
    count: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let env = process_env();
    let mut config = match &cli.config {
        Some(path) => WardenConfig::from_file(path)?,
        None => WardenConfig::default(),
    };
    config.apply_env_overrides(&env);
    info!(
        distributed = config.rate_limiter.enable_distributed,
        enabled = config.rate_limiter.enabled,
        "Configuration loaded"
    );

    let coordinator = AdmissionCoordinator::connect(&config, env).await?;

    match cli.command {
        Command::Check(args) => run_check(&coordinator, args).await?,
        Command::Resolve {
            endpoint,
            limit,
            window,
        } => {
            let hint = PolicyHint::new(PolicyType::IpBased, limit, window);
            let effective = coordinator.resolver().resolve(&endpoint, &hint);
            println!(
                "{}",
                serde_json::json!({
                    "endpoint": endpoint,
                    "limit": effective.limit,
                    "time-window-seconds": effective.time_window_seconds,
                    "enabled": effective.enabled,
                })
            );
        }
        Command::IssueKey {
            owner,
            limit,
            window,
            expiry_days,
        } => {
            let record = coordinator.api_keys().issue(&owner, limit, window, expiry_days);
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.with_thread_ids(true).init();
    }
}

async fn run_check(coordinator: &AdmissionCoordinator, args: CheckArgs) -> anyhow::Result<()> {
    let hint = PolicyHint::new(args.policy, args.limit, args.window);

    let mut ctx = RequestContext::new();
    if let Some(method) = args.method {
        ctx = ctx.with_method(method);
    }
    if let Some(user) = args.user {
        ctx = ctx.with_principal(user);
    }
    if let Some(key) = args.api_key {
        ctx = ctx.with_api_key(key);
    }

    for n in 1..=args.count {
        let decision = coordinator
            .decide(&args.ip, &args.endpoint, args.policy, &ctx, &hint)
            .await?;
        match &decision {
            Decision::Admit => println!("{}: admit", n),
            Decision::Reject(rejection) => {
                println!("{}: reject (retry in {}s)", n, rejection.wait_seconds)
            }
            Decision::Deny => println!("{}: deny", n),
        }
        let timestamp = chrono::Utc::now().timestamp_millis();
        if let Some(response) = decision.into_response(timestamp) {
            println!("   {} {}", response.status, response.body_json());
        }
    }

    Ok(())
}

mod settings;

use anyhow::Context as _;
use apiwire_auth::{
    AuthCodeEnvelope, AuthError, AuthManagerOptions, DeviceCodeError, MultiTenantAuthManager,
    TenantContext, TokenStore,
};
use apiwire_http_tools::{
    ApiDescription, HttpTransport, OperationError, OperationExecutor, TransportOptions,
};
use apiwire_resilience::serde_duration::parse_duration;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize as _;
use serde_json::{Value, json};
use std::io::IsTerminal as _;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_TENANT: &str = "default";

#[derive(Debug, Parser)]
#[command(name = "apiwire", version)]
#[command(about = "Call declared API operations with managed credentials and retries", long_about = None)]
struct Cli {
    /// API description (JSON).
    #[arg(long, short = 'c', env = "APIWIRE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// CLI defaults file. Defaults to `$XDG_CONFIG_HOME/apiwire/cli.json`.
    #[arg(long, env = "APIWIRE_SETTINGS", global = true)]
    settings: Option<PathBuf>,

    /// Tenant secret; hashed before use.
    #[arg(long, env = "APIWIRE_TENANT", global = true, hide_env_values = true)]
    tenant: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "APIWIRE_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the API description and list its operations.
    Check,
    /// Run one operation and print the response body.
    Call {
        service: String,
        operation: String,
        /// Arguments as a JSON object.
        #[arg(long, short = 'a')]
        args: Option<String>,
        /// Return immediately when device authorization is pending.
        #[arg(long)]
        no_wait: bool,
        /// How long to wait for device authorization.
        #[arg(long, default_value = "10m", value_parser = parse_duration)]
        wait_timeout: Duration,
        /// Print retry and circuit breaker counters to stderr afterwards.
        #[arg(long)]
        metrics: bool,
    },
    /// Show what an auth-code envelope contains.
    DecodeCode { envelope: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let settings_path = match &cli.settings {
        Some(p) => p.clone(),
        None => settings::default_settings_path()?,
    };
    let settings = settings::load_settings(&settings_path)?;

    match cli.command {
        Command::Check => {
            let (executor, shutdown) = build_executor(cli.config.as_ref(), &settings)?;
            print_summary(executor.description());
            shutdown.cancel();
            Ok(())
        }
        Command::Call {
            service,
            operation,
            args,
            no_wait,
            wait_timeout,
            metrics,
        } => {
            let args: Value = match args.as_deref() {
                Some(raw) => serde_json::from_str(raw).context("parse --args as JSON")?,
                None => Value::Null,
            };
            let tenant = cli
                .tenant
                .or_else(|| settings.tenant.clone())
                .unwrap_or_else(|| DEFAULT_TENANT.to_string());
            let ctx = TenantContext::from_secret(&tenant, &service);

            let (executor, shutdown) = build_executor(cli.config.as_ref(), &settings)?;
            let cancel = shutdown.child_token();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                }
            });

            let wait = (!no_wait).then_some(wait_timeout);
            let result = call_until_authorized(&executor, &ctx, &operation, &args, &cancel, wait).await;
            if metrics {
                eprintln!(
                    "{}",
                    serde_json::to_string_pretty(&json!({
                        "retry": executor.retry_metrics(),
                        "circuitBreakers": executor.circuit_breaker_metrics(),
                    }))?
                );
            }
            shutdown.cancel();

            let body = result.with_context(|| format!("call {service}.{operation}"))?;
            println!("{}", serde_json::to_string_pretty(&body)?);
            Ok(())
        }
        Command::DecodeCode { envelope } => {
            let decoded = AuthCodeEnvelope::decode(&envelope).context("decode envelope")?;
            println!("{}", serde_json::to_string_pretty(&decoded)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_ansi(std::io::stderr().is_terminal()).init();
    }
}

fn build_executor(
    config: Option<&PathBuf>,
    settings: &settings::CliSettings,
) -> anyhow::Result<(OperationExecutor, CancellationToken)> {
    let path = config
        .or(settings.description.as_ref())
        .context("no API description given (use --config or APIWIRE_CONFIG)")?;
    let description = ApiDescription::load(path)?;
    tracing::debug!(
        path = %path.display(),
        services = description.services.len(),
        "loaded API description"
    );

    let transport = HttpTransport::new(TransportOptions::default())?;
    let shutdown = CancellationToken::new();
    transport.spawn_idle_sweeper(shutdown.clone());

    let defaults = AuthManagerOptions::default();
    let auth = MultiTenantAuthManager::new(
        transport.client(),
        TokenStore::in_memory(),
        AuthManagerOptions {
            multi_tenant: settings.multi_tenant,
            external_url: settings.external_url.clone(),
            max_device_poll: settings.max_device_poll.unwrap_or(defaults.max_device_poll),
            ..defaults
        },
    );

    let executor = OperationExecutor::new(description, auth, transport)
        .with_context(|| format!("invalid API description {}", path.display()))?;
    Ok((executor, shutdown))
}

/// Call `operation`, and while device authorization is pending keep retrying until the user
/// approves, `wait` elapses, or the call is cancelled.
async fn call_until_authorized(
    executor: &OperationExecutor,
    ctx: &TenantContext,
    operation: &str,
    args: &Value,
    cancel: &CancellationToken,
    wait: Option<Duration>,
) -> anyhow::Result<Value> {
    let deadline = wait.map(|w| tokio::time::Instant::now() + w);
    let mut announced = false;
    loop {
        let pending = match executor.call(ctx, operation, args, cancel).await {
            Ok(response) => return Ok(response.body),
            Err(OperationError::Auth(AuthError::DeviceCodePending(pending))) => pending,
            Err(e) => return Err(e.into()),
        };
        if !announced {
            announce(&pending);
            announced = true;
        }
        let Some(deadline) = deadline else {
            anyhow::bail!("device authorization pending");
        };
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("timed out waiting for device authorization");
        }

        let pause = Duration::from_secs(pending.interval_secs.max(1));
        tokio::select! {
            () = cancel.cancelled() => anyhow::bail!("cancelled"),
            () = tokio::time::sleep(pause) => {}
        }
    }
}

fn announce(pending: &DeviceCodeError) {
    let text = pending.instructions();
    if std::io::stderr().is_terminal() {
        eprintln!("{}", text.yellow().bold());
    } else {
        eprintln!("{text}");
    }
}

fn print_summary(description: &ApiDescription) {
    for (name, service) in &description.services {
        let auth = service
            .auth
            .as_ref()
            .map_or("none", |a| a.auth_type.as_str());
        println!("{name} ({}, auth: {auth})", service.base_url);
        for (op_name, op) in &service.operations {
            println!("  {op_name}: {} {}", op.method.to_uppercase(), op.path);
        }
    }
}

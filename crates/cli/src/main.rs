use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};
use zaproute_cli::{build_gateway, open_store};
use zaproute_core::config::AppConfig;
use zaproute_core::redact::mask_secret;
use zaproute_core::types::{ConnectionSecret, Tenant};

#[derive(Parser)]
#[command(name = "zaproute")]
#[command(version)]
#[command(about = "WhatsApp webhook routing for a multi-tenant CRM")]
struct Cli {
    /// Config file (defaults to ~/.zaproute/config.toml)
    #[arg(short, long, global = true, env = "ZAPROUTE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the webhook and messaging gateway
    Serve,
    /// Apply database migrations
    Migrate,
    /// Show configuration and store status
    Status,
    /// Manage tenants (workspaces)
    Tenant {
        #[command(subcommand)]
        action: TenantActions,
    },
    /// Manage gateway connections
    Connection {
        #[command(subcommand)]
        action: ConnectionActions,
    },
    /// Map a legacy instance name to a tenant
    LegacyInstance {
        #[command(subcommand)]
        action: LegacyActions,
    },
}

#[derive(Subcommand)]
enum TenantActions {
    /// Add a tenant
    Add {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// Maximum number of gateway connections
        #[arg(long, default_value_t = 1)]
        connection_limit: i64,
        /// Fallback instance for outbound replies
        #[arg(long)]
        default_instance: Option<String>,
        /// Automation webhook that receives this tenant's events
        #[arg(long)]
        webhook_url: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConnectionActions {
    /// List all connections
    List,
    /// Register a gateway instance for a tenant
    Add {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        instance: String,
        /// Per-instance gateway API token
        #[arg(long)]
        api_token: Option<String>,
        /// Per-instance gateway base URL
        #[arg(long)]
        api_url: Option<String>,
    },
}

#[derive(Subcommand)]
enum LegacyActions {
    /// Add a legacy instance-to-tenant mapping
    Add {
        #[arg(long)]
        instance: String,
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.clone())
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    let log_directory = config.log_directory().ok_or_else(|| {
        anyhow::anyhow!("Cannot determine home directory; set logging.directory in config")
    })?;
    let (non_blocking, _guard) = tracing_appender::non_blocking(
        tracing_appender::rolling::daily(log_directory, "audit.jsonl"),
    );

    let audit_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_target(false)
        .with_level(false)
        .with_file(false)
        .with_line_number(false)
        .without_time()
        .with_filter(tracing_subscriber::filter::Targets::new().with_target("audit", Level::INFO));

    let stdout_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(Level::INFO.into());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(stdout_filter)
        .with_filter(tracing_subscriber::filter::filter_fn(|metadata| {
            metadata.target() != "audit"
        }));

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(audit_layer)
        .init();

    match cli.command {
        Commands::Serve => run_serve(config).await,
        Commands::Migrate => {
            open_store(&config).await?;
            info!("Migrations applied to {}", config.database.url);
            Ok(())
        }
        Commands::Status => run_status(&config, cli.config).await,
        Commands::Tenant { action } => run_tenant(&config, action).await,
        Commands::Connection { action } => run_connection(&config, action).await,
        Commands::LegacyInstance { action } => run_legacy(&config, action).await,
    }
}

async fn run_serve(config: AppConfig) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let gateway = build_gateway(&config, store)?;

    tokio::select! {
        res = gateway.start() => {
            if let Err(e) = &res {
                error!("Gateway error: {}", e);
            }
            res
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

async fn run_status(config: &AppConfig, custom_path: Option<PathBuf>) -> anyhow::Result<()> {
    println!("zaproute status\n");
    match custom_path.or_else(AppConfig::default_path) {
        Some(path) if path.exists() => println!("Config: {} ✓", path.display()),
        Some(path) => println!(
            "Config: {} (not found, using defaults and environment)",
            path.display()
        ),
        None => println!("Config: no home directory, using defaults and environment"),
    }

    println!("Listen: {}:{}", config.server.host, config.server.port);
    println!("Dispatch mode: {:?}", config.automation.dispatch_mode);

    let check = |name: &str, value: Option<&String>| match value {
        Some(v) if !v.is_empty() => println!("{}: {}", name, mask_secret(v)),
        _ => println!("{}: not set", name),
    };
    check("API token", config.server.api_token.as_ref());
    check("Webhook token", config.server.webhook_token.as_ref());
    check("App secret", config.server.app_secret.as_ref());
    check("Gateway API key", config.evolution.api_key.as_ref());
    println!(
        "Gateway URL: {}",
        config.evolution.api_url.as_deref().unwrap_or("not set")
    );
    println!(
        "Global automation webhook: {}",
        config.automation.global_webhook_url.as_deref().unwrap_or("not set")
    );

    match open_store(config).await {
        Ok(store) => {
            let stats = store.stats().await?;
            println!("\nDatabase: {} ✓", config.database.url);
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Err(e) => println!("\nDatabase: {} ✗ ({:#})", config.database.url, e),
    }
    Ok(())
}

async fn run_tenant(config: &AppConfig, action: TenantActions) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    match action {
        TenantActions::Add {
            id,
            name,
            connection_limit,
            default_instance,
            webhook_url,
        } => {
            store
                .insert_tenant(&Tenant {
                    id: id.clone(),
                    name,
                    connection_limit,
                    default_instance,
                    automation_webhook_url: webhook_url,
                })
                .await?;
            println!("Tenant '{}' added.", id);
        }
    }
    Ok(())
}

async fn run_connection(config: &AppConfig, action: ConnectionActions) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    match action {
        ConnectionActions::List => {
            let connections = store.list_connections().await?;
            if connections.is_empty() {
                println!("No connections.");
                return Ok(());
            }
            println!("{:<38} {:<12} {:<24} {:<14} Phone", "ID", "Tenant", "Instance", "Status");
            for c in connections {
                println!(
                    "{:<38} {:<12} {:<24} {:<14} {}",
                    c.id,
                    c.tenant_id,
                    c.instance_name,
                    c.status.as_str(),
                    c.phone_number.as_deref().unwrap_or("-")
                );
            }
        }
        ConnectionActions::Add {
            tenant,
            instance,
            api_token,
            api_url,
        } => {
            let secret = api_token.map(|api_token| ConnectionSecret { api_token, api_url });
            let connection = store
                .insert_connection(&tenant, &instance, secret.as_ref())
                .await?;
            println!("Connection '{}' added: {}", instance, connection.id);
        }
    }
    Ok(())
}

async fn run_legacy(config: &AppConfig, action: LegacyActions) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    match action {
        LegacyActions::Add {
            instance,
            tenant,
            token,
        } => {
            store
                .insert_legacy_instance(&instance, &tenant, token.as_deref())
                .await?;
            println!("Legacy instance '{}' mapped to tenant '{}'.", instance, tenant);
        }
    }
    Ok(())
}

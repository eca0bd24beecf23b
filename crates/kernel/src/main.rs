//! Wordnav CLI
//!
//! Resolves menus and checks permissions against the configured tables, and
//! syncs a user's menus with the menu API.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use wordnav_kernel::NavContext;
use wordnav_kernel::cache::CacheLayer;
use wordnav_kernel::config::Config;
use wordnav_kernel::menu::{ResolvedMenu, ResolvedMenuTree};
use wordnav_kernel::metrics::Metrics;
use wordnav_kernel::permissions::{PermissionMode, PermissionService};
use wordnav_kernel::sync::{HttpConfigSource, HttpPermissionSource};

/// Menu and permission tooling for the learning platform.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the menus a role can see.
    Resolve {
        #[command(flatten)]
        subject: SubjectArgs,

        #[arg(long, value_enum, default_value = "text")]
        format: Format,
    },

    /// Check one or more permissions for a role.
    Check {
        #[command(flatten)]
        subject: SubjectArgs,

        /// Whether any or all of the permissions are required.
        #[arg(long, default_value = "all")]
        mode: PermissionMode,

        #[arg(required = true)]
        permissions: Vec<String>,
    },

    /// Check whether a role may open a page.
    Page {
        #[command(flatten)]
        subject: SubjectArgs,

        path: String,
    },

    /// List roles with their effective permissions.
    Roles,

    /// Load a user's menus from the API and sync them.
    Sync {
        /// User whose role and permissions are fetched.
        #[arg(long)]
        user: String,

        #[arg(long, value_enum, default_value = "text")]
        format: Format,

        /// Print Prometheus metrics after syncing.
        #[arg(long)]
        metrics: bool,
    },
}

#[derive(clap::Args, Debug)]
struct SubjectArgs {
    /// Role to resolve for.
    #[arg(long)]
    role: String,

    /// Extra permissions granted directly (repeatable).
    #[arg(long = "grant")]
    granted: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Format {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;

    match cli.command {
        Command::Resolve { subject, format } => {
            let service = permission_service(&config, subject)?;
            print_tree(&service.resolve_catalog(), format)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Check {
            subject,
            mode,
            permissions,
        } => {
            let service = permission_service(&config, subject)?;
            let allowed = service.has_permissions(&permissions, mode);
            println!("{}", if allowed { "allowed" } else { "denied" });
            Ok(exit_code(allowed))
        }
        Command::Page { subject, path } => {
            let service = permission_service(&config, subject)?;
            let allowed = service.check_page_permission(&path);
            println!("{path}: {}", if allowed { "allowed" } else { "denied" });
            Ok(exit_code(allowed))
        }
        Command::Roles => {
            let table = config.permission_table()?.compile()?;
            for role in table.role_names() {
                let Some(perms) = table.role(role) else {
                    continue;
                };
                if perms.all {
                    println!("{role}: *");
                } else {
                    let list: Vec<&str> = perms.set.iter().map(String::as_str).collect();
                    println!("{role}: {}", list.join(", "));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Sync {
            user,
            format,
            metrics,
        } => sync(&config, &user, format, metrics).await,
    }
}

async fn sync(config: &Config, user: &str, format: Format, show_metrics: bool) -> Result<ExitCode> {
    let api_url = config.require_api_url()?;
    let registry = Arc::new(Metrics::new());

    let context = NavContext::builder(
        Arc::new(HttpConfigSource::new(api_url)?),
        Arc::new(HttpPermissionSource::new(api_url)?),
    )
    .permission_table(config.permission_table()?)
    .catalog(config.catalog()?)
    .cache_config(config.cache_config())
    .metrics(Arc::clone(&registry))
    .init(user)
    .await
    .context("failed to initialize navigation context")?;

    let outcome = context.sync().await.context("menu sync failed")?;
    let version = context.version_info();
    info!(outcome = outcome.label(), version = version.current, "sync complete");

    print_tree(&context.resolve_menus(), format)?;
    println!(
        "version {} ({}){}",
        version.current,
        outcome.label(),
        if version.has_conflicts {
            format!(
                ", conflicts: {}",
                version
                    .conflict_items
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        } else {
            String::new()
        }
    );

    if show_metrics {
        print!("{}", registry.encode());
    }

    context.dispose();
    Ok(exit_code(!version.has_conflicts))
}

fn permission_service(config: &Config, subject: SubjectArgs) -> Result<PermissionService> {
    let table = config.permission_table()?.compile()?;
    let catalog = config.catalog()?;
    Ok(PermissionService::new(
        Arc::new(table),
        Arc::new(catalog),
        CacheLayer::new(config.cache_config()),
        &subject.role,
        subject.granted,
    ))
}

fn print_tree(tree: &ResolvedMenuTree, format: Format) -> Result<()> {
    match format {
        Format::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(tree).context("failed to encode menus")?
            );
        }
        Format::Text => {
            for collection in &tree.collections {
                println!("[{}]", collection.name);
                for item in &collection.items {
                    print_item(item, 1);
                }
            }
        }
    }
    Ok(())
}

fn print_item(item: &ResolvedMenu, depth: usize) {
    let indent = "  ".repeat(depth);
    let path = item.path.as_deref().unwrap_or("-");
    let disabled = if item.enabled { "" } else { " (disabled)" };
    println!("{indent}{} {} {path}{disabled}", item.id, item.display_name);
    for child in &item.children {
        print_item(child, depth + 1);
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,wordnav_kernel=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use serde::Deserialize;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use job_access::authz::{build_resource_tree, PermissionIndex};
use job_access::events::ChangeFeed;
use job_access::models::{
    ActionEntity, Company, Distribution, PageEntity, ResourceId, ResourceNode, Section, ServiceEntity, SubjectContext,
};
use job_access::store::{fetch, insert, Filter, RecordStore, SqliteStore, StoredRecord};

#[derive(Parser, Debug)]
#[command(author, version, about = "job-access maintenance tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new reversible migration pair with the provided name
    MakeMigration { name: String },
    /// Apply pending migrations
    MigrateRun,
    /// Show migration status against the current database
    MigrateStatus,
    /// Roll back the last applied migration
    MigrateRollback,
    /// Load catalog and organization records from a JSON file
    Import { path: PathBuf },
    /// Print the service/page/action tree
    Tree,
    /// Explain whether a user in a job may use a resource
    Resolve {
        #[arg(long)]
        user: String,
        #[arg(long)]
        job: String,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        section: Option<String>,
        /// Resource id such as `s:5`, `ss:12` or `sss:3`
        resource: String,
    },
}

/// Import file layout. Every list is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CatalogFile {
    services: Vec<ServiceEntity>,
    pages: Vec<PageEntity>,
    actions: Vec<ActionEntity>,
    companies: Vec<Company>,
    sections: Vec<Section>,
    distributions: Vec<Distribution>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if dotenv().is_err() {
        let crate_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(crate_env);
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::MakeMigration { name } => {
            let (up, down) = make_migration_files(&name)?;
            println!("Created migration: {}", up.display());
            println!("Created migration: {}", down.display());
        }
        Commands::MigrateRun => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            migrator.run(&pool).await?;
            println!("Migrations applied");
        }
        Commands::MigrateStatus => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            print_status(&pool, &migrator).await?;
        }
        Commands::MigrateRollback => {
            let pool = get_pool().await?;
            let migrator = get_migrator().await?;
            let mut applied: Vec<i64> = applied_versions(&pool).await?.into_iter().collect();
            applied.sort_unstable();
            let last = applied.pop().context("no migrations were rolled back")?;
            let target = applied.last().copied().unwrap_or(0);
            migrator
                .undo(&pool, target)
                .await
                .context("no migrations were rolled back")?;
            println!("Rolled back migration {}", last);
        }
        Commands::Import { path } => {
            let store = get_store().await?;
            let counts = import_catalog(&store, &path).await?;
            println!("Imported {} records from {}", counts, path.display());
        }
        Commands::Tree => {
            let store = get_store().await?;
            let services: Vec<ServiceEntity> = fetch(&store, &Filter::new()).await?;
            let pages: Vec<PageEntity> = fetch(&store, &Filter::new()).await?;
            let actions: Vec<ActionEntity> = fetch(&store, &Filter::new()).await?;
            for node in build_resource_tree(&services, &pages, &actions) {
                print_node(&node, 0);
            }
        }
        Commands::Resolve { user, job, company, section, resource } => {
            let store = get_store().await?;
            let resource: ResourceId = resource.parse()?;
            let mut subject = SubjectContext::new(user, job);
            if let Some(company) = company {
                subject = subject.in_company(company);
            }
            if let Some(section) = section {
                subject = subject.in_section(section);
            }

            let index = PermissionIndex::load(&store).await?;
            let decision = index.explain(&subject, &resource);
            let verdict = if decision.is_allowed() { "allowed" } else { "denied" };
            println!("{} {} ({})", resource, verdict, serde_json::to_string(&decision)?.trim_matches('"'));
        }
    }

    Ok(())
}

async fn import_catalog(store: &SqliteStore, path: &Path) -> anyhow::Result<usize> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let catalog: CatalogFile =
        serde_json::from_str(&raw).with_context(|| format!("{} is not a valid catalog file", path.display()))?;

    let mut count = 0;
    count += insert_all(store, &catalog.services).await?;
    count += insert_all(store, &catalog.pages).await?;
    count += insert_all(store, &catalog.actions).await?;
    count += insert_all(store, &catalog.companies).await?;
    count += insert_all(store, &catalog.sections).await?;
    count += insert_all(store, &catalog.distributions).await?;
    Ok(count)
}

async fn insert_all<R: StoredRecord>(store: &dyn RecordStore, records: &[R]) -> anyhow::Result<usize> {
    for record in records {
        insert(store, record)
            .await
            .with_context(|| format!("failed to import into {}", R::collection()))?;
    }
    Ok(records.len())
}

fn print_node(node: &ResourceNode, depth: usize) {
    println!("{}{:<10} {}", "  ".repeat(depth), node.id.to_string(), node.label.en);
    for child in &node.children {
        print_node(child, depth + 1);
    }
}

fn make_migration_files(name: &str) -> anyhow::Result<(PathBuf, PathBuf)> {
    let timestamp = Utc::now().format("%Y%m%d%H%M%S");
    let sanitized = sanitize_name(name);
    let up = Path::new("migrations").join(format!("{}_{}.up.sql", timestamp, sanitized));
    let down = Path::new("migrations").join(format!("{}_{}.down.sql", timestamp, sanitized));

    if up.exists() || down.exists() {
        anyhow::bail!("migration already exists: {}", up.display());
    }

    fs::write(&up, "-- Write your migration SQL here\n")
        .with_context(|| format!("failed to create migration at {}", up.display()))?;
    fs::write(&down, "-- Undo the matching .up.sql here\n")
        .with_context(|| format!("failed to create migration at {}", down.display()))?;

    Ok((up, down))
}

async fn get_pool() -> anyhow::Result<SqlitePool> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to database")
}

async fn get_store() -> anyhow::Result<SqliteStore> {
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let pool = job_access::db::init(&database_url).await?;
    Ok(SqliteStore::new(pool, ChangeFeed::new(16)))
}

async fn applied_versions(pool: &SqlitePool) -> anyhow::Result<HashSet<i64>> {
    let table = sqlx::query("SELECT name FROM sqlite_master WHERE type='table' AND name='_sqlx_migrations'")
        .fetch_optional(pool)
        .await?;
    if table.is_none() {
        return Ok(HashSet::new());
    }

    let rows = sqlx::query("SELECT version FROM _sqlx_migrations WHERE success = 1")
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().filter_map(|row| row.try_get::<i64, _>("version").ok()).collect())
}

async fn print_status(pool: &SqlitePool, migrator: &sqlx::migrate::Migrator) -> anyhow::Result<()> {
    let applied = applied_versions(pool).await?;

    println!("{:<8} {:<20} {}", "Status", "Version", "Name");
    for migration in migrator.iter().filter(|m| m.migration_type.is_up_migration()) {
        let status = if applied.contains(&migration.version) { "applied" } else { "pending" };
        let desc = migration.description.as_ref().trim();
        let name = if desc.is_empty() { "unknown" } else { desc };
        println!("{:<8} {:<20} {}", status, migration.version, name);
    }

    Ok(())
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '_',
        })
        .collect()
}

async fn get_migrator() -> anyhow::Result<sqlx::migrate::Migrator> {
    let local = Path::new("./migrations");
    let migrator_path = if local.exists() {
        local.to_path_buf()
    } else {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")
    };

    let migrator_path_display = migrator_path.display().to_string();
    sqlx::migrate::Migrator::new(migrator_path)
        .await
        .with_context(|| format!("failed to load migrations from {}", migrator_path_display))
}

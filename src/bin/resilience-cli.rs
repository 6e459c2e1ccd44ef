use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "resilience-cli")]
#[command(about = "Management CLI for a resilience node", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "RESILIENCE_ADMIN_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Overall node and health status
    Status,
    /// List services and their instances
    Services,
    /// Show one service with its breaker state
    Service { name: String },
    /// Register an instance of a service
    Register {
        name: String,
        host: String,
        port: u16,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        health_check_url: Option<String>,
        #[arg(long)]
        weight: Option<u32>,
    },
    /// Remove an instance by id
    Deregister { id: String },
    /// Retry, timeout, bulkhead, breaker and failure statistics
    Resilience,
    /// List recorded failures
    Failures {
        #[arg(long)]
        service: Option<String>,
        #[arg(long)]
        unresolved: bool,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Mark a failure resolved
    Resolve { id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let client = reqwest::Client::builder().default_headers(headers).build()?;
    let base = cli.url.trim_end_matches('/');

    let res = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", base)).send().await?,
        Commands::Services => client.get(format!("{}/admin/services", base)).send().await?,
        Commands::Service { name } => {
            client.get(format!("{}/admin/services/{}", base, name)).send().await?
        }
        Commands::Register {
            name,
            host,
            port,
            id,
            health_check_url,
            weight,
        } => {
            let body = json!({
                "id": id,
                "host": host,
                "port": port,
                "health_check_url": health_check_url,
                "weight": weight,
            });
            client
                .post(format!("{}/admin/services/{}/instances", base, name))
                .json(&body)
                .send()
                .await?
        }
        Commands::Deregister { id } => {
            client.delete(format!("{}/admin/instances/{}", base, id)).send().await?
        }
        Commands::Resilience => client.get(format!("{}/admin/resilience", base)).send().await?,
        Commands::Failures {
            service,
            unresolved,
            limit,
        } => {
            let mut query: Vec<(&str, String)> = Vec::new();
            if let Some(service) = service {
                query.push(("service", service));
            }
            if unresolved {
                query.push(("resolved", "false".to_string()));
            }
            if let Some(limit) = limit {
                query.push(("limit", limit.to_string()));
            }
            client
                .get(format!("{}/admin/failures", base))
                .query(&query)
                .send()
                .await?
        }
        Commands::Resolve { id } => {
            client
                .post(format!("{}/admin/failures/{}/resolve", base, id))
                .send()
                .await?
        }
    };

    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let text = res.text().await?;
    if text.is_empty() {
        println!("{}", status);
        return Ok(());
    }
    let json: Value = serde_json::from_str(&text)?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

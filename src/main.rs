use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use std::path::PathBuf;

use pressroom::config::Config;
use pressroom::dashboard::Dashboard;
use pressroom::logging;
use pressroom::registry::ServiceRegistry;

#[derive(Parser, Debug)]
#[command(name = "pressroom")]
#[command(about = "Operator CLI for the print-production dashboard API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pressroom/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Store an access token for subsequent requests
  Login {
    token: String,
  },
  /// Forget the stored token and user record
  Logout,
  /// List a resource (orders, designs, materials, users)
  List {
    resource: String,
    /// Query parameter as key=value, repeatable
    #[arg(short, long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
  },
  /// Fetch one entity by id
  Get {
    resource: String,
    id: u64,
  },
  /// Probe every resource and print the aggregated health
  Health,
  /// Print request metrics per resource
  Metrics,
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
  raw
    .split_once('=')
    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
    .filter(|(k, _)| !k.is_empty())
    .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init()?;

  let config = Config::load(args.config.as_deref())?;
  let dashboard = Dashboard::connect(&config)?;
  let registry = ServiceRegistry::global();

  match args.command {
    Command::Login { token } => {
      dashboard.credentials().set_token(&token)?;
      println!("Token stored");
    }
    Command::Logout => {
      dashboard.credentials().clear()?;
      registry.clear_all_caches();
      println!("Logged out");
    }
    Command::List { resource, params } => {
      let params: Map<String, Value> = params
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
      let listed = dashboard
        .list_json(&resource, &Value::Object(params))
        .await
        .map_err(|e| eyre!("Listing {} failed: {}", resource, e))?;
      print_json(&listed)?;
    }
    Command::Get { resource, id } => {
      let entity = dashboard
        .get_json(&resource, id)
        .await
        .map_err(|e| eyre!("Fetching {} {} failed: {}", resource, id, e))?;
      print_json(&entity)?;
    }
    Command::Health => {
      print_json(&registry.health_status().await)?;
    }
    Command::Metrics => {
      print_json(&registry.all_metrics())?;
    }
  }

  Ok(())
}

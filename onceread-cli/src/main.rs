mod client;

use clap::{Parser, Subcommand};
use client::ApiClient;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_API_URL: &str = "http://localhost:8080";

#[derive(Parser)]
#[command(name = "onceread")]
#[command(about = "Create and read single-use secrets")]
struct Cli {
    /// Base URL of the onceread server
    #[arg(long, env = "ONCEREAD_API_URL", default_value = DEFAULT_API_URL, global = true)]
    api_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new secret
    Create {
        secret: String,
        /// One of 1h, 6h, 1d, 3d (server default when omitted)
        expiry: Option<String>,
    },
    /// Read a secret; it is destroyed afterwards
    Read {
        /// Read URL returned by `create`
        url: String,
        passcode: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "onceread_cli=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new();

    match cli.command {
        Commands::Create { secret, expiry } => {
            let created = client
                .create(&cli.api_url, &secret, expiry.as_deref())
                .await?;
            println!("Your secret is ready to share:");
            println!("ID: {}", created.id);
            println!("URL: {}", created.read_url);
            println!("Passcode: {}", created.passcode);
            println!("Expires: {}", created.expires_at.to_rfc2822());
        }
        Commands::Read { url, passcode } => {
            let secret = client.read(&url, &passcode).await?;
            println!("{}", secret);
        }
    }

    Ok(())
}

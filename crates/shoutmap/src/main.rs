//! shoutmap sync tool
//!
//! Subcommands:
//! - `simulate`: two sessions against an in-memory backend, printing the
//!   state both converge on
//! - `watch`: follow one shout's likes, comments and unread counts live

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod simulate;
mod watch;

#[derive(Parser)]
#[command(name = "shoutmap")]
#[command(about = "Realtime cache sync for shoutmap", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run two simulated viewers against an in-memory backend
    Simulate {
        /// Shout both viewers interact with
        #[arg(long, default_value = "shout-1")]
        shout: String,

        /// Make the first like write fail to show the rollback
        #[arg(long)]
        fail_first_like: bool,
    },

    /// Watch a shout on a live backend
    Watch {
        /// Project URL
        #[arg(long, env = "SHOUTMAP_URL")]
        url: String,

        /// Public API key
        #[arg(long, env = "SHOUTMAP_ANON_KEY")]
        anon_key: String,

        /// Access token of a signed-in user
        #[arg(long, env = "SHOUTMAP_ACCESS_TOKEN")]
        access_token: Option<String>,

        /// User id of the signed-in user (enables unread counters)
        #[arg(long, env = "SHOUTMAP_USER_ID")]
        user_id: Option<String>,

        /// Shout to follow
        #[arg(long)]
        shout: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "shoutmap=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            shout,
            fail_first_like,
        } => simulate::run(&shout, fail_first_like).await,

        Commands::Watch {
            url,
            anon_key,
            access_token,
            user_id,
            shout,
        } => watch::run(&url, &anon_key, access_token, user_id, &shout).await,
    }
}

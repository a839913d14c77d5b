use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "toiletime", version, about = "Unlock restricted apps for a bathroom break")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Save the restriction set and shield it
    Pick {
        /// Application tokens to restrict
        #[arg(long, value_delimiter = ',')]
        apps: Vec<String>,
        /// Category tokens to restrict
        #[arg(long, value_delimiter = ',')]
        categories: Vec<String>,
    },
    /// Print the shared state as JSON
    Status,
    /// Unlock everything for a number of minutes
    Unlock {
        minutes: u32,
        /// Return once the window is granted instead of counting down
        #[arg(long)]
        detach: bool,
    },
    /// End the current unlock and re-lock now
    Cancel,
    /// Deliver one interval callback, as the monitor extension would
    Monitor {
        /// start, warning or end
        event: String,
        #[arg(long, default_value = toiletime_lib::models::UNLOCK_ACTIVITY)]
        activity: String,
    },
    /// Run the interval monitor: deliver callbacks for stored registrations
    Monitord,
    /// Bring the shield in line with the stored state
    Reconcile,
}

#[tokio::main]
async fn main() {
    toiletime_lib::logging::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Pick { apps, categories } => commands::pick(apps, categories).await,
        Commands::Status => commands::status().await,
        Commands::Unlock { minutes, detach } => commands::unlock(minutes, detach).await,
        Commands::Cancel => commands::cancel().await,
        Commands::Monitor { event, activity } => commands::monitor(&event, &activity).await,
        Commands::Monitord => commands::monitord().await,
        Commands::Reconcile => commands::reconcile().await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

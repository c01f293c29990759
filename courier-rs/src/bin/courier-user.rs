//! Account management for the IMAP/SMTP credential database
//!
//! ```bash
//! courier-user --db sqlite://users.db?mode=rwc add user@example.com password123
//! courier-user --db sqlite://users.db passwd user@example.com n3w-secret
//! courier-user --db sqlite://users.db delete user@example.com
//! courier-user --db sqlite://users.db list
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use courier_rs::security::SqliteAuthenticator;

#[derive(Parser)]
#[command(name = "courier-user")]
#[command(about = "Manage mail user accounts", long_about = None)]
struct Cli {
    /// Database URL (e.g., sqlite://users.db?mode=rwc)
    #[arg(short, long, default_value = "sqlite://mail.db?mode=rwc")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a new user
    Add {
        /// User email address
        email: String,
        /// User password
        password: String,
    },
    /// Replace a user's password
    Passwd {
        email: String,
        password: String,
    },
    /// Delete a user
    Delete {
        /// User email address
        email: String,
    },
    /// List all users
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let auth = SqliteAuthenticator::new(&cli.db)
        .await
        .with_context(|| format!("Failed to open {}", cli.db))?;

    match cli.command {
        Commands::Add { email, password } => {
            if auth.user_exists(&email).await? {
                bail!("User {} already exists", email);
            }
            auth.add_user(&email, &password).await?;
            println!("User {} added", email);
        }
        Commands::Passwd { email, password } => {
            auth.set_password(&email, &password).await?;
            println!("Password updated for {}", email);
        }
        Commands::Delete { email } => {
            auth.delete_user(&email).await?;
            println!("User {} deleted", email);
        }
        Commands::List => {
            let users = auth.list_users().await?;

            if users.is_empty() {
                println!("No users found.");
            } else {
                println!("{:<30} {:<20} {:<20}", "Email", "Created At", "Last Login");
                println!("{:-<70}", "");

                for (email, created_at, last_login) in &users {
                    let last_login = last_login.as_deref().unwrap_or("Never");
                    println!("{:<30} {:<20} {:<20}", email, created_at, last_login);
                }

                println!("\nTotal: {} user(s)", users.len());
            }
        }
    }

    Ok(())
}

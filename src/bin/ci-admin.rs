//! Administrative CLI: provision users and API keys against the Store directly.

use ci_runner::config::{AdminCommand, AdminConfig};
use ci_runner::store::{PostgresStore, Store};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let _ = dotenvy::dotenv();
    let config = AdminConfig::parse();

    let store = PostgresStore::connect(&config.database_url).await?;
    store.run_migrations().await?;

    match config.command {
        AdminCommand::CreateUser { name, email } => {
            let user = store.create_user(&name, &email).await?;
            println!("created user {} ({})", user.id, user.email);
        }
        AdminCommand::CreateKey { user_id, name } => {
            let minted = store.create_api_key(user_id, &name).await?;
            println!("created key {}", minted.record.id);
            println!("secret (shown once): {}", minted.secret);
        }
        AdminCommand::RevokeKey { key_id } => {
            store.revoke_api_key(key_id).await?;
            println!("revoked key {key_id}");
        }
        AdminCommand::ListUsers => {
            for user in store.list_users().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    user.id,
                    user.name,
                    user.email,
                    if user.is_active { "active" } else { "inactive" }
                );
            }
        }
        AdminCommand::SetUserActive { user_id, active } => {
            store.set_user_active(user_id, active).await?;
            println!("user {user_id} is now {}", if active { "active" } else { "inactive" });
        }
    }

    Ok(())
}

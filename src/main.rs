//! whisper-notify operator CLI.
//!
//! Inspects the server identity and the encrypted session directory. The
//! server itself is embedded by the application that owns the transport
//! node; see the `whisper_notify` library.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use p256::elliptic_curve::sec1::ToEncodedPoint;

use whisper_notify::config::PASSPHRASE_ENV;
use whisper_notify::{ChatSession, Config, Hash, Phase, ServerIdentity, SessionKind, SessionStore};

#[derive(Parser)]
#[command(name = "whisper-notify")]
#[command(version)]
#[command(about = "Push notification handshake server over gossip topics")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every protocol phase with its topic id
    Topics,
    /// Print (creating if needed) the server identity
    Identity,
    /// Inspect stored sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List stored session ids
    List,
    /// Decrypt and describe one session (never prints the key)
    Show {
        /// Session id (key hash, with or without 0x)
        id: String,
    },
    /// Delete one stored session
    Delete {
        /// Session id (key hash, with or without 0x)
        id: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Topics => {
            for phase in Phase::ALL {
                println!("{:<20} {}", phase.name(), phase.topic());
            }
            Ok(())
        }
        Commands::Identity => show_identity(&Config::load()?),
        Commands::Sessions { command } => {
            let config = Config::load()?;
            let store = SessionStore::open(config.session_dir(), config.kdf)
                .context("Failed to open session directory")?;
            match command {
                SessionCommands::List => list_sessions(&store),
                SessionCommands::Show { id } => show_session(&config, &store, &parse_id(&id)?),
                SessionCommands::Delete { id } => delete_session(&store, &parse_id(&id)?),
            }
        }
    }
}

fn show_identity(config: &Config) -> Result<()> {
    let identity = ServerIdentity::load_or_create(&config.identity_path(), config.server_id.clone())?;
    let public_key = identity.public_key();
    println!("server id:   {}", identity.server_id());
    println!("fingerprint: {}", identity.fingerprint());
    println!(
        "public key:  0x{}",
        hex::encode(public_key.to_encoded_point(false).as_bytes())
    );
    Ok(())
}

fn list_sessions(store: &SessionStore) -> Result<()> {
    let ids = store.list()?;
    if ids.is_empty() {
        println!("No stored sessions in {}", store.dir().display());
    }
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

fn show_session(config: &Config, store: &SessionStore, id: &Hash) -> Result<()> {
    let passphrase = config
        .passphrase()
        .with_context(|| format!("{PASSPHRASE_ENV} is not set"))?;
    let session = store.get(id, passphrase)?;

    println!("id:         {}", session.key_hash);
    println!("type:       {}", session.kind);
    let names: Vec<&str> = session.attributes.keys().map(String::as_str).collect();
    println!("attributes: {}", names.join(", "));
    if session.kind == SessionKind::Chat {
        let chat = ChatSession::from_session(&session)?;
        println!("parent:     {}", chat.parent);
        if let Some(chat_id) = &chat.chat_id {
            println!("chat:       {chat_id}");
        }
        println!("devices:    {}", chat.devices.into_inner().len());
    }
    Ok(())
}

fn delete_session(store: &SessionStore, id: &Hash) -> Result<()> {
    if store.delete(id)? {
        println!("Deleted {id}");
    } else {
        println!("No stored session {id}");
    }
    Ok(())
}

fn parse_id(id: &str) -> Result<Hash> {
    id.parse()
        .with_context(|| format!("Invalid session id '{id}'"))
}

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use keyward_core::config::ClientConfig;
use keyward_core::{Attributes, Error};
use keyward_secret_service::ss::DEFAULT_CONTENT_TYPE;
use keyward_secret_service::{Collection, Item, Outcome, PromptResult, SecretService, Session};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;
use zvariant::OwnedObjectPath;

#[tokio::main]
async fn main() -> Result<()> {
    // Reset SIGPIPE so piping into `head` exits quietly.
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let (config_path, args) = split_config_arg(std::env::args().skip(1).collect())?;
    let cmd = args.first().map(String::as_str).unwrap_or("help");
    if matches!(cmd, "help" | "--help" | "-h") {
        print_help();
        return Ok(());
    }

    let config = load_config(&config_path.unwrap_or_else(default_config_path))?;
    let service = SecretService::connect(config)
        .await
        .context("cannot reach the Secret Service on the session bus")?;

    match cmd {
        "search" => cmd_search(&service, &args[1..]).await,
        "get" | "store" => {
            let session = open_session(&service).await?;
            let result = if cmd == "get" {
                cmd_get(&service, &session, &args[1..]).await
            } else {
                cmd_store(&service, &session, &args[1..]).await
            };
            service.close_session(&session).await;
            result
        }
        "delete" => cmd_delete(&service, &args[1..]).await,
        "lock" => cmd_lock(&service, &args[1..], true).await,
        "unlock" => cmd_lock(&service, &args[1..], false).await,
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        "\
keyward - freedesktop Secret Service client

USAGE:
    keyward [--config <path>] <command> [args...]

COMMANDS:
    search [key=value]...               List items whose attributes match (no args = all)
    get <item-path>                     Print the secret of an item to stdout
    store <label> [key=value]...        Store stdin as a secret in the configured collection
    delete <item-path>                  Delete an item
    lock [collection-path]              Lock a collection (default: configured collection)
    unlock [collection-path]            Unlock a collection, prompting if needed
    help                                Show this help

OPTIONS:
    -c, --config <path>                 Config file (default: $XDG_CONFIG_HOME/keyward/config.toml)

ENVIRONMENT:
    RUST_LOG                            Log filter for stderr output (default: warn)

EXAMPLES:
    keyward search app=mail
    keyward get /org/freedesktop/secrets/collection/login/1
    printf %s hunter2 | keyward store 'Mail password' app=mail user=alice
    keyward unlock"
    );
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Pull `--config <path>`, `-c <path>` or `--config=<path>` out of `args`.
fn split_config_arg(args: Vec<String>) -> Result<(Option<PathBuf>, Vec<String>)> {
    let mut path = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            let Some(value) = iter.next() else {
                bail!("--config requires a path argument");
            };
            path = Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("--config=") {
            path = Some(PathBuf::from(value));
        } else {
            rest.push(arg);
        }
    }
    Ok((path, rest))
}

fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| {
            tracing::warn!("neither XDG_CONFIG_HOME nor HOME are set; using current directory for config");
            PathBuf::from(".")
        });
    base.join("keyward").join("config.toml")
}

fn load_config(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        tracing::warn!("config file not found at {}, using defaults", path.display());
        return Ok(ClientConfig::default());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(meta) if meta.mode() & 0o077 != 0 => {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:o}", meta.mode() & 0o777),
                    "config file is accessible by group or others, recommend chmod 600"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("could not check config file permissions: {e}"),
        }
    }

    let config = ClientConfig::load(path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    tracing::debug!(path = %path.display(), algorithm = %config.algorithm, "config loaded");
    Ok(config)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn open_session(service: &SecretService) -> Result<Session> {
    let session = service
        .open_session()
        .await
        .context("failed to open a session with the Secret Service")?;
    if session.fell_back() {
        eprintln!("warning: service does not support encryption, secrets travel as plaintext");
    }
    Ok(session)
}

fn parse_attributes(args: &[String]) -> Result<Attributes> {
    let mut attributes = Attributes::new();
    for arg in args {
        let Some((key, value)) = arg.split_once('=') else {
            bail!("expected key=value, got '{arg}'");
        };
        if key.is_empty() {
            bail!("empty attribute name in '{arg}'");
        }
        attributes.insert(key.to_string(), value.to_string());
    }
    Ok(attributes)
}

/// Wait for a prompt if `outcome` needs one. `None` means the user dismissed it.
async fn settle<T>(service: &SecretService, outcome: Outcome<T>) -> Result<Option<T>> {
    if outcome.is_prompt() {
        eprintln!("waiting for confirmation in the Secret Service prompt...");
    }
    let timeout = service.config().prompt_timeout();
    match outcome.resolve(service.prompts(), timeout).await {
        Ok(PromptResult::Completed(value)) => Ok(Some(value)),
        Ok(PromptResult::Dismissed) => Ok(None),
        Err(Error::PromptTimeout) => bail!("prompt timed out after {}s", timeout.as_secs()),
        Err(e) => Err(e.into()),
    }
}

async fn target_collection(service: &SecretService, arg: Option<&String>) -> Result<Collection> {
    match arg {
        Some(path) => Ok(service.collection(path)?),
        None => Ok(service.configured_collection().await?),
    }
}

/// Unlock `path` through the service, prompting if needed. Returns false if
/// the user dismissed the prompt.
async fn ensure_unlocked(service: &SecretService, path: &OwnedObjectPath) -> Result<bool> {
    let outcome = service.unlock(std::slice::from_ref(path)).await?;
    Ok(settle(service, outcome).await?.is_some())
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn cmd_search(service: &SecretService, args: &[String]) -> Result<()> {
    let attributes = parse_attributes(args)?;
    let found = service.search_items(&attributes).await?;
    print_items(&found.unlocked, "").await?;
    print_items(&found.locked, "  [locked]").await?;
    if found.unlocked.is_empty() && found.locked.is_empty() {
        eprintln!("no matching items");
    }
    Ok(())
}

async fn print_items(items: &[Item], suffix: &str) -> Result<()> {
    for item in items {
        let label = item.label().await?;
        println!("{}\t{label}{suffix}", item.path().as_str());
    }
    Ok(())
}

async fn cmd_get(service: &SecretService, session: &Session, args: &[String]) -> Result<()> {
    let Some(path) = args.first() else {
        bail!("missing item path");
    };
    let item = service.item(path)?;
    if item.is_locked().await? && !ensure_unlocked(service, item.path()).await? {
        bail!("unlock dismissed, secret not read");
    }
    let secret = item.get_secret(session).await?;
    let mut out = io::stdout().lock();
    out.write_all(secret.as_slice())?;
    out.flush()?;
    Ok(())
}

async fn cmd_store(service: &SecretService, session: &Session, args: &[String]) -> Result<()> {
    let Some(label) = args.first() else {
        bail!("missing label");
    };
    let attributes = parse_attributes(&args[1..])?;

    let mut secret = Zeroizing::new(Vec::new());
    io::stdin()
        .read_to_end(&mut secret)
        .context("failed to read secret from stdin")?;
    if secret.last() == Some(&b'\n') {
        secret.pop();
    }

    let collection = service.configured_collection().await?;
    if collection.is_locked().await? && !ensure_unlocked(service, collection.path()).await? {
        bail!("unlock dismissed, nothing stored");
    }
    let outcome = collection
        .create_item(session, label, &attributes, &secret, DEFAULT_CONTENT_TYPE, true)
        .await?;
    match settle(service, outcome).await? {
        Some(item) => println!("{}", item.path().as_str()),
        None => bail!("store dismissed, nothing stored"),
    }
    Ok(())
}

async fn cmd_delete(service: &SecretService, args: &[String]) -> Result<()> {
    let Some(path) = args.first() else {
        bail!("missing item path");
    };
    let outcome = service.item(path)?.delete().await?;
    if settle(service, outcome).await?.is_none() {
        bail!("delete dismissed, item kept");
    }
    println!("deleted {path}");
    Ok(())
}

async fn cmd_lock(service: &SecretService, args: &[String], lock: bool) -> Result<()> {
    let collection = target_collection(service, args.first()).await?;
    let objects = [collection.path().clone()];
    let outcome = if lock {
        service.lock(&objects).await?
    } else {
        service.unlock(&objects).await?
    };
    let verb = if lock { "locked" } else { "unlocked" };
    match settle(service, outcome).await? {
        Some(done) if done.is_empty() => println!("nothing {verb}"),
        Some(done) => {
            for path in done {
                println!("{verb} {}", path.as_str());
            }
        }
        None => bail!("prompt dismissed, nothing {verb}"),
    }
    Ok(())
}

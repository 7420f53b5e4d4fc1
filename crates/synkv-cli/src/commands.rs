use anyhow::{bail, Context};
use colored::Colorize;
use serde_json::{json, Map, Value};
use synkv_backend::{Backend, FileBackend};
use synkv_store::{Lookup, Store};
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::cli::*;
use crate::config::CliConfig;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = CliConfig::resolve(&cli)?;
    debug!(root = %config.root.display(), namespace = %config.namespace, "resolved config");
    let format = cli.format;
    match cli.command {
        Command::Get(args) => cmd_get(&config, format, args).await,
        Command::Set(args) => cmd_set(&config, format, args).await,
        Command::List(_) => cmd_list(&config, format).await,
        Command::Watch(args) => cmd_watch(&config, format, args).await,
    }
}

fn open_store(config: &CliConfig, watch: bool) -> anyhow::Result<Store<Value>> {
    let backend = FileBackend::open(config.namespace()?, config.backend_config(watch))
        .with_context(|| format!("opening namespace under {}", config.root.display()))?;
    Ok(Store::with_config(backend, config.store_config()))
}

fn status(lookup: &Lookup<Value>) -> &'static str {
    match lookup {
        Lookup::Found(_) => "found",
        Lookup::Absent => "unset",
        Lookup::Corrupt => "corrupt",
        Lookup::Unavailable => "unavailable",
    }
}

fn render(lookup: &Lookup<Value>) -> String {
    match lookup {
        Lookup::Found(v) => v.to_string(),
        Lookup::Absent => "(unset)".dimmed().to_string(),
        Lookup::Corrupt => "(corrupt)".red().to_string(),
        Lookup::Unavailable => "(unavailable)".yellow().to_string(),
    }
}

fn lookup_json(key: &str, lookup: &Lookup<Value>) -> Value {
    json!({
        "key": key,
        "status": status(lookup),
        "value": lookup.value().cloned().unwrap_or(Value::Null),
    })
}

async fn cmd_get(config: &CliConfig, format: OutputFormat, args: GetArgs) -> anyhow::Result<()> {
    let store = open_store(config, false)?;
    let lookup = store.load(&args.key).await;
    match format {
        OutputFormat::Text => println!("{}", render(&lookup)),
        OutputFormat::Json => println!("{}", lookup_json(&args.key, &lookup)),
    }
    Ok(())
}

fn parse_value(args: &SetArgs) -> anyhow::Result<Value> {
    if args.string {
        return Ok(Value::String(args.value.clone()));
    }
    serde_json::from_str(&args.value).with_context(|| {
        format!(
            "`{}` is not valid JSON (use --string to store it as text)",
            args.value
        )
    })
}

async fn cmd_set(config: &CliConfig, format: OutputFormat, args: SetArgs) -> anyhow::Result<()> {
    let value = parse_value(&args)?;
    let store = open_store(config, false)?;
    let mut errors = store.errors();

    store.set(args.key.as_str(), value.clone())?;
    store.flush().await;
    if let Ok(err) = errors.try_recv() {
        bail!("{err}");
    }

    match format {
        OutputFormat::Text => {
            println!("{} {} = {}", "✓".green().bold(), args.key.bold(), value)
        }
        OutputFormat::Json => println!("{}", json!({ "key": args.key, "value": value })),
    }
    Ok(())
}

async fn cmd_list(config: &CliConfig, format: OutputFormat) -> anyhow::Result<()> {
    let store = open_store(config, false)?;
    let keys = store.backend().keys().await.context("listing keys")?;

    match format {
        OutputFormat::Text => {
            if keys.is_empty() {
                println!("No keys in {}.", store.namespace().to_string().bold());
            }
            for key in &keys {
                let lookup = store.load(key).await;
                println!("{} = {}", key.bold(), render(&lookup));
            }
        }
        OutputFormat::Json => {
            let mut out = Map::new();
            for key in keys {
                let lookup = store.load(&key).await;
                out.insert(key, lookup.into_value().unwrap_or(Value::Null));
            }
            println!("{}", Value::Object(out));
        }
    }
    Ok(())
}

fn print_change(format: OutputFormat, key: &str, value: &Value) {
    match format {
        OutputFormat::Text => println!("{} {} = {}", "→".cyan(), key.bold(), value),
        OutputFormat::Json => println!("{}", json!({ "key": key, "value": value })),
    }
}

async fn cmd_watch(config: &CliConfig, format: OutputFormat, args: WatchArgs) -> anyhow::Result<()> {
    let store = open_store(config, true)?;
    let keys = if args.keys.is_empty() {
        store.backend().keys().await.context("listing keys")?
    } else {
        args.keys
    };
    if keys.is_empty() {
        bail!("namespace is empty; name the keys to watch");
    }

    let mut guards = Vec::with_capacity(keys.len());
    for key in &keys {
        // Prime the cache so only later changes are printed.
        store.load(key).await;
        let label = key.clone();
        let sub = store.subscribe(key.as_str(), move |value: &Value| {
            print_change(format, &label, value)
        });
        guards.push(sub.into_guard());
    }

    if format == OutputFormat::Text {
        println!(
            "Watching {} key(s) in {} (Ctrl-C to stop)",
            keys.len().to_string().bold(),
            store.namespace().to_string().yellow()
        );
    }

    let mut errors = store.errors();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            received = errors.recv() => match received {
                Ok(err) => eprintln!("{} {err}", "error:".red().bold()),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
        }
    }

    drop(guards);
    store.teardown();
    Ok(())
}

use std::{path::Path, process, sync::Arc};

use querycache::{
    application::{RelationDef, StandardGrammar, StaticRelationGraph},
    cache::{CacheConfig, CacheLookup, KeyCodec, KeyHasher, KeyPrefix, Sha256KeyHasher, TagIndex},
    config::{self, KeyArgs, LogFormat, Settings},
    domain::{ConnectionId, QueryDescriptor, ReadOperation},
    infra::{error::InfraError, telemetry},
};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{Dispatch, Level, debug, dispatcher, error};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        config::Command::Key(args) => run_key(&settings, &args).await,
        config::Command::Config => run_config(&settings).await,
    }
}

/// Input accepted by the `key` command.
#[derive(Debug, Deserialize)]
struct KeyDocument {
    query: QueryDescriptor,
    operation: ReadOperation,
    /// Connection to key against; the configured connection when absent.
    #[serde(default)]
    connection: Option<ConnectionId>,
    #[serde(default)]
    relations: Vec<RelationDef>,
}

async fn run_key(settings: &Settings, args: &KeyArgs) -> Result<(), InfraError> {
    let raw = read_input(&args.input).await?;
    let KeyDocument {
        mut query,
        operation,
        connection,
        relations,
    } = serde_json::from_slice(&raw)?;

    query.connection = connection.unwrap_or_else(|| settings.connection.connection_id());

    let cache_config = CacheConfig::from(&settings.cache);
    let prefix = KeyPrefix::from_config(&cache_config);
    let codec = KeyCodec::new(prefix.clone(), Arc::new(StandardGrammar::new()));
    let tag_index = TagIndex::new(prefix, Arc::new(StaticRelationGraph::from_defs(relations)));

    let key = codec.make_key(&query, &operation)?;
    let tags = tag_index.make_tags(&query)?;
    let hashed_key = Sha256KeyHasher.hash(&key);
    debug!(key = %key, hashed_key = %hashed_key, tags = %tags, "Derived cache lookup");

    let lookup = CacheLookup {
        key,
        hashed_key,
        tags,
    };
    write_json(&serde_json::to_value(&lookup)?).await
}

async fn run_config(settings: &Settings) -> Result<(), InfraError> {
    let format = match settings.logging.format {
        LogFormat::Json => "json",
        LogFormat::Compact => "compact",
    };
    let document = serde_json::json!({
        "cache": settings.cache,
        "connection": settings.connection,
        "logging": {
            "level": settings.logging.level.to_string(),
            "format": format,
        },
    });
    write_json(&document).await
}

async fn read_input(path: &Path) -> Result<Vec<u8>, InfraError> {
    let mut buffer = Vec::new();
    if path == Path::new("-") {
        tokio::io::stdin().read_to_end(&mut buffer).await?;
    } else {
        buffer = tokio::fs::read(path).await?;
    }
    Ok(buffer)
}

async fn write_json(value: &serde_json::Value) -> Result<(), InfraError> {
    let mut rendered = serde_json::to_vec_pretty(value)?;
    rendered.push(b'\n');
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&rendered).await?;
    stdout.flush().await?;
    Ok(())
}

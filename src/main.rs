use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use polyvox::applier::StreamApplier;
use polyvox::branch;
use polyvox::config::Config;
use polyvox::engine::MetacognitiveEngine;
use polyvox::gate::{self, GateState, PersonaContext};
use polyvox::generate::{EchoGenerator, Generate, TranscriptPreprocessor};
use polyvox::llm::LLMClient;
use polyvox::message::{Message, NewMessage};
use polyvox::orchestrator::Orchestrator;
use polyvox::persona::{self, Persona, PersonaRef};
use polyvox::store::{FileStore, Persist, StoreError};
use polyvox::tree::{Conversation, ConversationTree};
use polyvox::turn::{prepare_write, TurnRunner, WriteRequest};
use polyvox::wire;

/// Polyvox - one prompt, several personas answering side by side
#[derive(Parser, Debug)]
#[command(name = "polyvox", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one multi-persona turn and print the update stream as NDJSON
    Chat {
        /// Persona name (repeatable)
        #[arg(short, long = "persona")]
        personas: Vec<String>,

        /// JSON file with full persona profiles
        #[arg(long)]
        personas_file: Option<PathBuf>,

        /// Persona id from the profiles file to answer with (repeatable; default: all)
        #[arg(long = "active")]
        active: Vec<String>,

        /// Directory conversations are saved in
        #[arg(short, long)]
        store: Option<PathBuf>,

        /// Continue a stored conversation
        #[arg(long, requires = "store")]
        conversation: Option<String>,

        /// Answer with the offline echo generator instead of the LLM
        #[arg(long)]
        offline: bool,

        prompt: String,
    },
    /// Apply a recorded NDJSON stream to a fresh reply and print the result
    Replay { file: PathBuf },
}

/// Used when no store directory is given.
struct Discard;

#[async_trait]
impl Persist for Discard {
    async fn persist(&self, _: &str, _: &[Message], _: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

fn slug(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Every known persona plus the ids selected to answer this turn.
fn load_personas(
    names: &[String],
    active: &[String],
    file: Option<&PathBuf>,
) -> Result<(Vec<Persona>, Vec<String>), Box<dyn std::error::Error>> {
    let mut all: Vec<Persona> = match file {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Vec::new(),
    };
    all.extend(names.iter().map(|n| Persona::new(slug(n), n.trim())));
    let mut ids: Vec<String> = active.iter().cloned().chain(names.iter().map(|n| slug(n))).collect();
    if ids.is_empty() {
        ids = all.iter().map(|p| p.id.clone()).collect();
    }
    Ok((all, ids))
}

fn generator(offline: bool, config: &Config) -> Result<Arc<dyn Generate>, Box<dyn std::error::Error>> {
    if offline {
        return Ok(Arc::new(EchoGenerator));
    }
    match LLMClient::from_env() {
        Some(client) => Ok(Arc::new(client?.with_max_tokens(config.generation.max_tokens))),
        None => Err("LLM_BASE_URL and LLM_API_KEY must be set (or pass --offline)".into()),
    }
}

async fn chat(
    config: Config,
    personas: Vec<Persona>,
    active_ids: Vec<String>,
    store_dir: Option<PathBuf>,
    conversation_id: Option<String>,
    offline: bool,
    prompt: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let (persist, mut conversation): (Arc<dyn Persist>, Conversation) = match &store_dir {
        Some(dir) => {
            let store = FileStore::open(dir)?;
            let conversation = match &conversation_id {
                Some(id) => store
                    .load(id)
                    .await?
                    .ok_or_else(|| format!("conversation '{}' not found", id))?,
                None => Conversation::new(uuid::Uuid::new_v4().to_string()),
            };
            (Arc::new(store), conversation)
        }
        None => (
            Arc::new(Discard),
            Conversation::new(uuid::Uuid::new_v4().to_string()),
        ),
    };

    let active = persona::resolve_active(&personas, &active_ids);
    if active.is_empty() {
        return Err("no active personas (archived or unknown ids)".into());
    }
    info!(active = active.len(), known = personas.len(), "personas resolved");

    let parent_id = branch::path(&conversation.tree, None)
        .last()
        .map(|m| m.id.clone());
    let plan = prepare_write(
        &mut conversation.tree,
        WriteRequest::New {
            parent_id,
            prompt,
            files: vec![],
        },
        None,
    )?;

    let orchestrator = Orchestrator::new(generator(offline, &config)?, Arc::new(TranscriptPreprocessor))
        .with_channel_capacity(config.generation.channel_capacity);
    let runner = TurnRunner::new(orchestrator, Arc::clone(&persist));

    let (tx, mut rx) = mpsc::channel::<String>(config.generation.channel_capacity);
    let printer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            print!("{}", line);
        }
    });
    let summary = runner
        .run(&mut conversation, &plan, &active, &personas, tx)
        .await?;
    printer.await?;
    info!(
        conversation_id = %conversation.id,
        message_id = %summary.message_id,
        title = %summary.title,
        "turn complete"
    );

    // Surface a reflective prompt for the new reply, if one is due.
    let gate_state = GateState {
        target_frequency: gate::select_frequency(&config.metacognitive, &mut rand::thread_rng()),
        ..Default::default()
    };
    let (mut engine, _shown) = MetacognitiveEngine::new(config.metacognitive.clone(), gate_state);
    engine
        .set_personas(PersonaContext {
            active_personas: active.iter().map(|p| p.id.clone()).collect(),
            personas: personas.iter().map(PersonaRef::from).collect(),
        })
        .await;
    let visible: Vec<Message> = branch::path(&conversation.tree, Some(&plan.target_id))
        .into_iter()
        .cloned()
        .collect();
    engine.observe(visible, false).await;
    if let Some(decision) = engine.evaluate().await {
        if gate::record_shown(&mut conversation.tree, &decision, Utc::now())? {
            match &decision.suggested_persona_id {
                Some(id) => eprintln!(
                    "{} (try {})",
                    decision.prompt_text,
                    persona::display_name(&personas, id)
                ),
                None => eprintln!("{}", decision.prompt_text),
            }
            persist
                .persist(&conversation.id, conversation.tree.messages(), &conversation.title)
                .await?;
        }
    }
    Ok(())
}

async fn replay(config: Config, file: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let reader = BufReader::new(tokio::fs::File::open(&file).await?);
    let events = wire::read_events(reader);

    let mut tree = ConversationTree::new();
    let user = tree.add_child(NewMessage::user(""), None)?;
    let target = tree.add_child(NewMessage::assistant(), Some(&user))?;

    let abort = CancellationToken::new();
    let upstream = CancellationToken::new();
    let on_interrupt = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping replay");
            on_interrupt.cancel();
        }
    });

    let mut applier = StreamApplier::new(target, config.stream.debounce());
    let outcome = applier
        .consume(&mut tree, events, &abort, &upstream)
        .await?;
    info!(
        message_id = %outcome.message_id,
        finished = outcome.finished,
        cancelled = outcome.cancelled,
        error = ?outcome.error,
        "replay complete"
    );
    let message = tree.require(&outcome.message_id)?;
    println!("{}", serde_json::to_string_pretty(message)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    }
    .apply_env();

    match args.command {
        Command::Chat {
            personas,
            personas_file,
            active,
            store,
            conversation,
            offline,
            prompt,
        } => {
            let (personas, active) = load_personas(&personas, &active, personas_file.as_ref())?;
            info!(personas = personas.len(), offline, "polyvox chat starting");
            chat(config, personas, active, store, conversation, offline, prompt).await
        }
        Command::Replay { file } => replay(config, file).await,
    }
}

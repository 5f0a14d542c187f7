use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use futures_util::future::OptionFuture;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use locality_connect::api::ApiClient;
use locality_connect::api::types::{
    ApiError, Category, LocalityRequest, LoginRequest, RegisterRequest, Suggestion, VoteType,
};
use locality_connect::auth::{AuthError, AuthSession};
use locality_connect::chat::message::{format_timestamp, now_ms};
use locality_connect::chat::{
    ChatBackend, ChatError, ChatSession, ChatView, Identity, MessageView, OfflineBackend, SessionState, Topic,
};
use locality_connect::config::{ClientConfig, ConfigError, parse_url};
use locality_connect::error::{ErrorCode, ErrorReport};
use locality_connect::realtime::{FirebaseLog, MemoryLog, RealtimeLog, TransportError};
use locality_connect::suggestions::{self, SuggestionError, VoteGate};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    Suggestion(#[from] SuggestionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("not logged in; run `locality auth login` first")]
    NotLoggedIn,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("terminal I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorCode for CliError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Config(e) => e.error_code(),
            Self::Api(e) => e.error_code(),
            Self::Auth(e) => e.error_code(),
            Self::Chat(e) => e.error_code(),
            Self::Suggestion(e) => e.error_code(),
            Self::Transport(e) => e.error_code(),
            Self::NotLoggedIn => "E_NOT_LOGGED_IN",
            Self::InvalidJson(_) => "E_INVALID_JSON",
            Self::Io(_) => "E_IO",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Api(e) => e.retryable(),
            Self::Chat(e) => e.retryable(),
            Self::Suggestion(e) => e.retryable(),
            Self::Transport(e) => e.retryable(),
            _ => false,
        }
    }
}

// =============================================================================
// ARGUMENTS
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "locality", about = "Locality Connect community feedback client")]
struct Cli {
    /// Server origin; `/api` is appended.
    #[arg(long, env = "LOCALITY_API_BASE_URL")]
    base_url: Option<String>,

    /// Realtime database URL used for chat.
    #[arg(long, env = "LOCALITY_REALTIME_URL")]
    database_url: Option<String>,

    /// Directory holding the saved login.
    #[arg(long, env = "LOCALITY_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Auth(AuthCommand),
    Locality(LocalityCommand),
    Suggestion(SuggestionCommand),
    /// Like or dislike a suggestion.
    Vote {
        suggestion_id: i64,
        #[arg(value_enum)]
        vote: VoteArg,
    },
    /// Join the discussion chat of a suggestion.
    Chat(ChatArgs),
}

#[derive(Args, Debug)]
struct AuthCommand {
    #[command(subcommand)]
    command: AuthSubcommand,
}

#[derive(Subcommand, Debug)]
enum AuthSubcommand {
    Register {
        #[arg(long)]
        username: String,
        #[arg(long)]
        email: String,
        #[arg(long, env = "LOCALITY_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        phone_number: String,
        #[arg(long)]
        locality_id: i64,
    },
    Login {
        username: String,
        #[arg(long, env = "LOCALITY_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Logout,
    Whoami,
}

#[derive(Args, Debug)]
struct LocalityCommand {
    #[command(subcommand)]
    command: LocalitySubcommand,
}

#[derive(Subcommand, Debug)]
enum LocalitySubcommand {
    List,
    Get {
        id: i64,
    },
    Create {
        name: String,
        #[arg(long, help = "Extra fields as a JSON object")]
        data: Option<String>,
    },
    Update {
        id: i64,
        name: String,
        #[arg(long, help = "Extra fields as a JSON object")]
        data: Option<String>,
    },
}

#[derive(Args, Debug)]
struct SuggestionCommand {
    #[command(subcommand)]
    command: SuggestionSubcommand,
}

#[derive(Subcommand, Debug)]
enum SuggestionSubcommand {
    /// Suggestions in your locality.
    Dashboard,
    /// Suggestions you wrote.
    Mine,
    /// Suggestions open for discussion.
    Discussion,
    Create(SuggestionFields),
    Update {
        id: i64,
        #[command(flatten)]
        fields: SuggestionFields,
    },
    Delete {
        id: i64,
    },
}

#[derive(Args, Debug)]
struct SuggestionFields {
    #[arg(long)]
    title: String,
    #[arg(long)]
    description: String,
    #[arg(long, value_enum, default_value_t = CategoryArg::Suggestion)]
    category: CategoryArg,
    /// 1 (low) to 5 (high).
    #[arg(long)]
    priority: Option<u8>,
}

#[derive(Args, Debug)]
struct ChatArgs {
    suggestion_id: String,
    /// Title shown in the header.
    #[arg(long)]
    title: Option<String>,
    /// Use an in-process log instead of the server.
    #[arg(long, default_value_t = false)]
    offline: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CategoryArg {
    Suggestion,
    Complaint,
}

impl From<CategoryArg> for Category {
    fn from(value: CategoryArg) -> Self {
        match value {
            CategoryArg::Suggestion => Self::Suggestion,
            CategoryArg::Complaint => Self::Complaint,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum VoteArg {
    Like,
    Dislike,
}

impl From<VoteArg> for VoteType {
    fn from(value: VoteArg) -> Self {
        match value {
            VoteArg::Like => Self::Like,
            VoteArg::Dislike => Self::Dislike,
        }
    }
}

// =============================================================================
// ENTRY
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(error) = dotenvy::dotenv() {
        if !error.not_found() {
            eprintln!("ignoring .env: {error}");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{}", ErrorReport::from_error(&error));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = resolve_config(&cli)?;
    let auth = Arc::new(match config.session_file() {
        Some(path) => AuthSession::load(path)?,
        None => AuthSession::in_memory(),
    });
    let api = Arc::new(ApiClient::new(&config, auth.clone())?);

    match cli.command {
        Command::Auth(command) => run_auth(&api, &auth, command).await,
        Command::Locality(command) => run_locality(&api, command).await,
        Command::Suggestion(command) => run_suggestion(&api, command).await,
        Command::Vote { suggestion_id, vote } => {
            let votes = VoteGate::new();
            votes.cast(api.as_ref(), suggestion_id, vote.into()).await?;
            println!("voted {} on #{suggestion_id}", suggestions::vote_label(vote.into()));
            Ok(())
        }
        Command::Chat(args) => run_chat(&config, api, auth, args).await,
    }
}

/// Environment first, then flags on top.
fn resolve_config(cli: &Cli) -> Result<ClientConfig, CliError> {
    let mut config = ClientConfig::from_env()?;
    if let Some(url) = &cli.base_url {
        config.api_base_url = parse_url("--base-url", url.clone())?;
    }
    if let Some(url) = &cli.database_url {
        config.realtime_url = parse_url("--database-url", url.clone())?;
    }
    if let Some(dir) = &cli.state_dir {
        config.state_dir = Some(dir.clone());
    }
    Ok(config)
}

// =============================================================================
// REST COMMANDS
// =============================================================================

async fn run_auth(api: &ApiClient, auth: &AuthSession, command: AuthCommand) -> Result<(), CliError> {
    match command.command {
        AuthSubcommand::Register { username, email, password, full_name, phone_number, locality_id } => {
            let request = RegisterRequest { username, email, password, full_name, phone_number, locality_id };
            api.register(&request).await?;
            println!("registered {}; log in to continue", request.username);
            Ok(())
        }
        AuthSubcommand::Login { username, password } => {
            let user = api.login(&LoginRequest { username, password }).await?;
            println!("logged in as {} (id {})", user.username, user.id);
            Ok(())
        }
        AuthSubcommand::Logout => {
            auth.clear()?;
            println!("logged out");
            Ok(())
        }
        AuthSubcommand::Whoami => {
            let user = auth.user().ok_or(CliError::NotLoggedIn)?;
            print_json(&user)
        }
    }
}

async fn run_locality(api: &ApiClient, command: LocalityCommand) -> Result<(), CliError> {
    match command.command {
        LocalitySubcommand::List => print_json(&api.localities().await?),
        LocalitySubcommand::Get { id } => print_json(&api.locality(id).await?),
        LocalitySubcommand::Create { name, data } => {
            let request = LocalityRequest { name, details: parse_details(data.as_deref())? };
            print_json(&api.create_locality(&request).await?)
        }
        LocalitySubcommand::Update { id, name, data } => {
            let request = LocalityRequest { name, details: parse_details(data.as_deref())? };
            print_json(&api.update_locality(id, &request).await?)
        }
    }
}

async fn run_suggestion(api: &ApiClient, command: SuggestionCommand) -> Result<(), CliError> {
    match command.command {
        SuggestionSubcommand::Dashboard => print_suggestions(&api.dashboard().await?),
        SuggestionSubcommand::Mine => {
            let mine = api.my_suggestions().await?;
            print_suggestions(&mine);
            println!(
                "{} of {} new suggestions used",
                suggestions::new_count(&mine),
                suggestions::MAX_NEW_SUGGESTIONS
            );
        }
        SuggestionSubcommand::Discussion => print_suggestions(&api.discussion().await?),
        SuggestionSubcommand::Create(fields) => {
            let body = suggestions::draft(&fields.title, &fields.description, fields.category.into(), fields.priority)?;
            suggestions::ensure_quota(&api.my_suggestions().await?)?;
            let created = api.create_suggestion(&body).await?;
            print_suggestions(std::slice::from_ref(&created));
        }
        SuggestionSubcommand::Update { id, fields } => {
            let body = suggestions::draft(&fields.title, &fields.description, fields.category.into(), fields.priority)?;
            let updated = api.update_suggestion(id, &body).await?;
            print_suggestions(std::slice::from_ref(&updated));
        }
        SuggestionSubcommand::Delete { id } => {
            api.delete_suggestion(id).await?;
            println!("deleted #{id}");
        }
    }
    Ok(())
}

fn parse_details(data: Option<&str>) -> Result<Map<String, Value>, CliError> {
    match data {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(Map::new()),
    }
}

fn print_json(value: &impl Serialize) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_suggestions(list: &[Suggestion]) {
    if list.is_empty() {
        println!("(none)");
    }
    for s in list {
        let mut line = format!(
            "#{:<5} {:<14} {:<10} {}  [+{} -{}]",
            s.id,
            suggestions::status_label(s.status),
            suggestions::category_label(s.category),
            s.title,
            s.like_count,
            s.dislike_count,
        );
        if let Some(priority) = s.user_priority {
            line.push_str(&format!(" priority {priority}"));
        }
        if let Some(priority) = s.calculated_priority {
            line.push_str(&format!(" system {priority}"));
        }
        if let Some(author) = &s.username {
            line.push_str(&format!(" by {author}"));
        }
        println!("{line}");
    }
}

// =============================================================================
// CHAT
// =============================================================================

async fn run_chat(
    config: &ClientConfig,
    api: Arc<ApiClient>,
    auth: Arc<AuthSession>,
    args: ChatArgs,
) -> Result<(), CliError> {
    let identity: Arc<dyn Identity> = auth.clone();
    let backend: Arc<dyn ChatBackend>;
    let log: Arc<dyn RealtimeLog>;
    if args.offline {
        let memory = Arc::new(MemoryLog::new());
        backend = Arc::new(OfflineBackend::new(memory.clone(), identity.clone()));
        log = memory;
    } else {
        if auth.user().is_none() {
            return Err(CliError::NotLoggedIn);
        }
        backend = api;
        log = Arc::new(FirebaseLog::new(
            &config.realtime_url,
            config.realtime_auth.clone(),
            Duration::from_secs(config.timeouts.connect_secs),
        )?);
    }

    let mut topic = Topic::new(args.suggestion_id);
    if let Some(title) = args.title {
        topic = topic.with_title(title);
    }
    eprintln!(
        "chat: {} (type a message and press enter; /retry, /quit)",
        topic.title.as_deref().unwrap_or(&topic.id)
    );

    let session = ChatSession::new(backend, log, identity);
    if let Err(error) = session.open(topic).await {
        tracing::debug!(%error, "initial open failed");
    }
    let result = chat_repl(&session, BufReader::new(tokio::io::stdin()), print_line).await;
    session.close();
    result
}

/// Render view changes and run input lines against `session` until EOF,
/// `/quit` or Ctrl-C.
async fn chat_repl<R>(session: &ChatSession, input: R, mut emit: impl FnMut(Line)) -> Result<(), CliError>
where
    R: AsyncBufRead + Unpin,
{
    let mut views = session.subscribe_view();
    let mut transcript = Transcript::default();
    let view = views.borrow_and_update().clone();
    transcript.update(&view, now_ms()).into_iter().for_each(&mut emit);

    let mut lines = input.lines();
    // At most one session command (send or retry) runs at a time. It is
    // polled alongside input so the transcript keeps updating and Ctrl-C
    // still works while it is out.
    let mut pending: Option<Pin<Box<dyn Future<Output = Result<(), ChatError>> + '_>>> = None;
    loop {
        tokio::select! {
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                transcript.update(&view, now_ms()).into_iter().for_each(&mut emit);
            }
            Some(result) = OptionFuture::from(pending.as_mut()), if pending.is_some() => {
                pending = None;
                if let Err(error) = result {
                    // backend failures already show up inline in the view
                    if !matches!(error, ChatError::Backend(_)) {
                        emit(Line::Status(ErrorReport::from_error(&error).to_string()));
                    }
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    _ if pending.is_some() => emit(Line::Status(BUSY.into())),
                    "/retry" => pending = Some(Box::pin(session.retry())),
                    text => pending = Some(Box::pin(send_line(session, text.to_owned()))),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

const BUSY: &str = "-- busy; wait for the previous message";

async fn send_line(session: &ChatSession, text: String) -> Result<(), ChatError> {
    session.send(&text).await
}

fn print_line(line: Line) {
    match line {
        Line::Status(text) => eprintln!("{text}"),
        Line::Message(text) => println!("{text}"),
    }
}

/// One line of chat output: status goes to stderr, messages to stdout.
#[derive(Debug, PartialEq, Eq)]
enum Line {
    Status(String),
    Message(String),
}

/// Turns views into output lines: each message once, plus state and
/// error changes.
///
/// Messages come out in the view's sorted order. When one arrives that
/// sorts before something already printed, the whole list is redrawn
/// under a marker line so the terminal never shows a misordered history.
#[derive(Default)]
struct Transcript {
    shown: HashSet<String>,
    state: Option<&'static str>,
    error: Option<String>,
}

impl Transcript {
    fn update(&mut self, view: &ChatView, now: i64) -> Vec<Line> {
        let mut lines = Vec::new();

        let state = view.state.name();
        if self.state != Some(state) {
            self.state = Some(state);
            match &view.state {
                SessionState::Initializing => lines.push(Line::Status("-- connecting".into())),
                SessionState::Subscribed(handle) => lines.push(Line::Status(format!("-- connected ({handle})"))),
                SessionState::Failed(_) => lines.push(Line::Status("-- disconnected; /retry to reconnect".into())),
                SessionState::Idle => {}
            }
        }

        if view.error_message != self.error {
            if let Some(message) = &view.error_message {
                lines.push(Line::Status(format!("!! {message}")));
            }
            self.error.clone_from(&view.error_message);
        }

        let Some(first_new) = view
            .messages
            .iter()
            .position(|item| !self.shown.contains(&item.message.id))
        else {
            return lines;
        };
        let reordered = view.messages[first_new..]
            .iter()
            .any(|item| self.shown.contains(&item.message.id));
        let start = if reordered {
            lines.push(Line::Status("-- earlier messages arrived; history so far:".into()));
            0
        } else {
            first_new
        };
        for item in &view.messages[start..] {
            self.shown.insert(item.message.id.clone());
            lines.push(Line::Message(message_line(item, now)));
        }
        lines
    }
}

fn message_line(item: &MessageView, now: i64) -> String {
    let who = if item.own { "you" } else { item.message.author_name.as_str() };
    format!("[{}] {who}: {}", format_timestamp(item.message.timestamp, now), item.message.text)
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;

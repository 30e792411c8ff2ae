use std::sync::Mutex;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use yoga_studio::auth::AuthError;
use yoga_studio::config::{ClientConfig, ConfigError};
use yoga_studio::net::TransportError;
use yoga_studio::net::types::{Session, Teacher};
use yoga_studio::services::ResourceError;
use yoga_studio::workflows::{self, WorkflowError};
use yoga_studio::{
    ApiClient, AuthGateway, Navigator, Notifier, Route, Router, SessionApi, SessionDetail, SessionForm, SessionState,
    TeacherApi, UserApi,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("http client setup failed: {0}")]
    Transport(#[from] TransportError),
    #[error("missing credentials; pass --email/--password or set YOGA_EMAIL/YOGA_PASSWORD")]
    MissingCredentials,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("{route} is not available here; redirected to {redirect}")]
    Redirected { route: String, redirect: String },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "yoga-cli", about = "Yoga Studio API CLI")]
struct Cli {
    /// Backend origin. Falls back to `YOGA_API_BASE_URL`, then `http://localhost:8080`.
    #[arg(long)]
    base_url: Option<String>,

    #[arg(long, env = "YOGA_EMAIL")]
    email: Option<String>,

    #[arg(long, env = "YOGA_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in and print the session information.
    Login,
    /// Create an account with --email/--password.
    Register {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
    },
    Me(MeCommand),
    Sessions(SessionsCommand),
    Teachers(TeachersCommand),
}

#[derive(Args, Debug)]
struct MeCommand {
    #[command(subcommand)]
    command: MeSubcommand,
}

#[derive(Subcommand, Debug)]
enum MeSubcommand {
    Show,
    Delete,
}

#[derive(Args, Debug)]
struct SessionsCommand {
    #[command(subcommand)]
    command: SessionsSubcommand,
}

#[derive(Subcommand, Debug)]
enum SessionsSubcommand {
    List,
    Show {
        id: i64,
    },
    Create {
        #[command(flatten)]
        fields: SessionFields,
    },
    Update {
        id: i64,
        #[command(flatten)]
        fields: SessionFields,
    },
    Delete {
        id: i64,
    },
    Participate {
        id: i64,
    },
    Unparticipate {
        id: i64,
    },
}

#[derive(Args, Debug)]
struct SessionFields {
    #[arg(long)]
    name: Option<String>,
    #[arg(long, help = "Day of the session, YYYY-MM-DD")]
    date: Option<String>,
    #[arg(long)]
    teacher_id: Option<i64>,
    #[arg(long)]
    description: Option<String>,
}

impl SessionFields {
    fn apply(self, form: &mut SessionForm) {
        if let Some(name) = self.name {
            form.name = name;
        }
        if let Some(date) = self.date {
            form.date = date;
        }
        if let Some(teacher_id) = self.teacher_id {
            form.teacher_id = Some(teacher_id);
        }
        if let Some(description) = self.description {
            form.description = description;
        }
    }
}

#[derive(Args, Debug)]
struct TeachersCommand {
    #[command(subcommand)]
    command: TeachersSubcommand,
}

#[derive(Subcommand, Debug)]
enum TeachersSubcommand {
    List,
    Show { id: i64 },
}

// =============================================================================
// VIEW-LAYER STAND-INS
// =============================================================================

/// Records where the guards and workflows sent us.
#[derive(Debug, Default)]
struct CliNavigator {
    visited: Mutex<Vec<Route>>,
}

impl CliNavigator {
    fn last(&self) -> Option<Route> {
        self.visited
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .last()
            .cloned()
    }
}

impl Navigator for CliNavigator {
    fn navigate(&self, route: &Route) {
        tracing::info!(%route, "navigate");
        self.visited
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(route.clone());
    }
}

/// Toasts go to stderr so stdout stays pure JSON.
struct CliNotifier;

impl Notifier for CliNotifier {
    fn notify(&self, message: &str) {
        eprintln!("{message}");
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DetailView<'a> {
    session: &'a Session,
    teacher: Option<&'a Teacher>,
    is_admin: bool,
    is_participant: bool,
}

impl<'a> From<&'a SessionDetail> for DetailView<'a> {
    fn from(detail: &'a SessionDetail) -> Self {
        Self {
            session: detail.session(),
            teacher: detail.teacher(),
            is_admin: detail.is_admin(),
            is_participant: detail.is_participant(),
        }
    }
}

// =============================================================================
// CONTEXT
// =============================================================================

struct CliContext {
    session: SessionState,
    client: ApiClient,
    router: Router<SessionState, CliNavigator>,
    email: Option<String>,
    password: Option<String>,
}

impl CliContext {
    fn new(cli: &Cli) -> Result<Self, CliError> {
        let env_config = ClientConfig::from_env()?;
        let config = match &cli.base_url {
            Some(url) => ClientConfig::new(url)?.with_timeouts(env_config.timeouts),
            None => env_config,
        };
        tracing::debug!(base_url = %config.base_url, "client configured");

        let session = SessionState::new();
        let client = ApiClient::from_config(&config, session.clone())?;
        Ok(Self {
            router: Router::new(session.clone(), CliNavigator::default()),
            session,
            client,
            email: cli.email.clone(),
            password: cli.password.clone(),
        })
    }

    fn navigator(&self) -> &CliNavigator {
        self.router.navigator()
    }

    fn credentials(&self) -> Result<(&str, &str), CliError> {
        match (&self.email, &self.password) {
            (Some(email), Some(password)) => Ok((email.as_str(), password.as_str())),
            _ => Err(CliError::MissingCredentials),
        }
    }

    /// Run `route` through its guard.
    fn open(&self, route: &Route) -> Result<Route, CliError> {
        self.router.resolve(&route.path()).ok_or_else(|| CliError::Redirected {
            route: route.path(),
            redirect: self.navigator().last().map_or_else(|| "/".to_owned(), |r| r.path()),
        })
    }

    /// Log in when credentials are available, then open `route`.
    async fn open_protected(&self, route: &Route) -> Result<Route, CliError> {
        if let Ok((email, password)) = self.credentials() {
            self.gateway().login(email, password).await?;
        }
        self.open(route)
    }

    fn gateway(&self) -> AuthGateway {
        AuthGateway::new(self.client.clone(), self.session.clone())
    }

    fn sessions(&self) -> SessionApi {
        SessionApi::new(self.client.clone())
    }

    fn teachers(&self) -> TeacherApi {
        TeacherApi::new(self.client.clone())
    }

    fn users(&self) -> UserApi {
        UserApi::new(self.client.clone())
    }

    async fn detail(&self, id: i64) -> Result<SessionDetail, CliError> {
        Ok(SessionDetail::load(self.sessions(), self.teachers(), self.session.clone(), id).await?)
    }

    fn ensure_admin(&self, route: &Route) -> Result<(), CliError> {
        if workflows::open_form(&self.session, self.navigator()) {
            return Ok(());
        }
        Err(CliError::Redirected { route: route.path(), redirect: Route::Sessions.path() })
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let ctx = CliContext::new(&cli)?;

    match cli.command {
        Command::Login => run_login(&ctx).await,
        Command::Register { first_name, last_name } => run_register(&ctx, &first_name, &last_name).await,
        Command::Me(me) => run_me(&ctx, me).await,
        Command::Sessions(sessions) => run_sessions(&ctx, sessions).await,
        Command::Teachers(teachers) => run_teachers(&ctx, teachers).await,
    }
}

async fn run_login(ctx: &CliContext) -> Result<(), CliError> {
    ctx.open(&Route::Login)?;
    let (email, password) = ctx.credentials()?;
    let information = ctx.gateway().login(email, password).await?;
    ctx.navigator().navigate(&Route::Sessions);
    print_json(&information)
}

async fn run_register(ctx: &CliContext, first_name: &str, last_name: &str) -> Result<(), CliError> {
    ctx.open(&Route::Register)?;
    let (email, password) = ctx.credentials()?;
    ctx.gateway().register(email, first_name, last_name, password).await?;
    ctx.navigator().navigate(&Route::Login);
    print_json(&serde_json::json!({ "registered": email }))
}

async fn run_me(ctx: &CliContext, me: MeCommand) -> Result<(), CliError> {
    ctx.open_protected(&Route::Me).await?;
    match me.command {
        MeSubcommand::Show => {
            let user = workflows::current_user(&ctx.users(), &ctx.session).await?;
            print_json(&user)
        }
        MeSubcommand::Delete => {
            workflows::delete_account(&ctx.users(), &ctx.session, &CliNotifier, ctx.navigator()).await?;
            Ok(())
        }
    }
}

async fn run_sessions(ctx: &CliContext, sessions: SessionsCommand) -> Result<(), CliError> {
    match sessions.command {
        SessionsSubcommand::List => {
            ctx.open_protected(&Route::Sessions).await?;
            print_json(&ctx.sessions().all().await?)
        }
        SessionsSubcommand::Show { id } => {
            ctx.open_protected(&Route::SessionDetail(id)).await?;
            let detail = ctx.detail(id).await?;
            print_json(&DetailView::from(&detail))
        }
        SessionsSubcommand::Create { fields } => {
            let route = ctx.open_protected(&Route::SessionCreate).await?;
            ctx.ensure_admin(&route)?;
            let mut form = SessionForm::default();
            fields.apply(&mut form);
            let saved = workflows::save_session(&ctx.sessions(), &form, None, &CliNotifier, ctx.navigator()).await?;
            print_json(&saved)
        }
        SessionsSubcommand::Update { id, fields } => {
            let route = ctx.open_protected(&Route::SessionUpdate(id)).await?;
            ctx.ensure_admin(&route)?;
            let existing = ctx.sessions().detail(id).await?;
            let mut form = SessionForm::from_session(&existing);
            fields.apply(&mut form);
            let saved =
                workflows::save_session(&ctx.sessions(), &form, Some(id), &CliNotifier, ctx.navigator()).await?;
            print_json(&saved)
        }
        SessionsSubcommand::Delete { id } => {
            ctx.open_protected(&Route::SessionDetail(id)).await?;
            let detail = ctx.detail(id).await?;
            detail.delete(&CliNotifier, ctx.navigator()).await?;
            Ok(())
        }
        SessionsSubcommand::Participate { id } => {
            ctx.open_protected(&Route::SessionDetail(id)).await?;
            let mut detail = ctx.detail(id).await?;
            detail.participate().await?;
            print_json(&DetailView::from(&detail))
        }
        SessionsSubcommand::Unparticipate { id } => {
            ctx.open_protected(&Route::SessionDetail(id)).await?;
            let mut detail = ctx.detail(id).await?;
            detail.unparticipate().await?;
            print_json(&DetailView::from(&detail))
        }
    }
}

async fn run_teachers(ctx: &CliContext, teachers: TeachersCommand) -> Result<(), CliError> {
    // Teachers are only listed from the session pages.
    ctx.open_protected(&Route::Sessions).await?;
    match teachers.command {
        TeachersSubcommand::List => print_json(&ctx.teachers().all().await?),
        TeachersSubcommand::Show { id } => print_json(&ctx.teachers().detail(id).await?),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn update_fields_override_only_given_values() {
        let mut form = SessionForm {
            name: "Morning Flow".into(),
            date: "2025-03-01".into(),
            teacher_id: Some(1),
            description: "Gentle start".into(),
        };
        let fields = SessionFields { name: None, date: Some("2025-03-02".into()), teacher_id: None, description: None };

        fields.apply(&mut form);

        assert_eq!(form.name, "Morning Flow");
        assert_eq!(form.date, "2025-03-02");
        assert_eq!(form.teacher_id, Some(1));
    }

    #[test]
    fn navigator_remembers_last_redirect() {
        let navigator = CliNavigator::default();
        assert!(navigator.last().is_none());
        navigator.navigate(&Route::Login);
        navigator.navigate(&Route::Sessions);
        assert_eq!(navigator.last(), Some(Route::Sessions));
    }

    #[test]
    fn protected_route_is_redirected_when_logged_out() {
        let router = Router::new(SessionState::new(), CliNavigator::default());
        assert!(router.resolve(&Route::Me.path()).is_none());
        assert_eq!(router.navigator().last(), Some(Route::Login));
    }
}

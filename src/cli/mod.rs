pub mod report;
pub mod social;
pub mod track;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use report::{CalendarCommand, DayCommand};
use social::{FriendsCommand, GroupsCommand};
use tracing::level_filters::LevelFilter;

use crate::platform::apps::PlainCatalog;
use crate::platform::auth::{AuthProvider, LocalAuth};
use crate::platform::usage_stats::EventLogUsageStats;
use crate::session::{Dependencies, Session};
use crate::store::fs_remote::FsRemoteStore;
use crate::store::local::LocalStore;
use crate::usage::stats::day_status;
use crate::utils::clock::DefaultClock;
use crate::utils::dir::create_application_default_path;
use crate::utils::logging::enable_logging;

#[derive(Parser, Debug)]
#[command(name = "PixelDiet", version)]
#[command(about = "Screen time goals with friends and groups", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long, global = true, help = "Enable logging")]
    log: bool,
    #[arg(
        long,
        global = true,
        help = "Application directory. By default tries to save into $XDG_DATA_HOME or $HOME/.local/share"
    )]
    dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Sign in and pull the account state")]
    Login {
        #[arg(
            long,
            help = "Credential of an existing account. Signs in anonymously when omitted"
        )]
        user: Option<String>,
    },
    #[command(about = "Sign out and remove the local data of the current user")]
    Logout {},
    #[command(about = "Show today's usage against the goals")]
    Today {},
    #[command(about = "Show the goal and usage maps recorded for one day")]
    Day {
        #[command(flatten)]
        command: DayCommand,
    },
    #[command(about = "Show a month of goal verdicts and the usage chart")]
    Calendar {
        #[command(flatten)]
        command: CalendarCommand,
    },
    #[command(subcommand, about = "Manage tracked apps and their goals")]
    Apps(AppsCommand),
    #[command(about = "Check today against a total goal across all tracked apps")]
    Goal {
        #[arg(help = "Goal minutes for everything tracked together")]
        minutes: Option<u32>,
        #[arg(long, help = "Judge by the sum of per-app goals instead")]
        clear: bool,
    },
    #[command(about = "Pull profile, goals, usage, groups and friends from the remote store")]
    Sync {},
    #[command(
        about = "Run the foreground tracker: periodic refresh, midnight goal push, group monitor"
    )]
    Track {},
    #[command(subcommand, about = "Friends and friend requests")]
    Friends(FriendsCommand),
    #[command(subcommand, about = "Shared-goal groups")]
    Groups(GroupsCommand),
}

#[derive(Subcommand, Debug)]
enum AppsCommand {
    #[command(about = "List tracked apps with their goals")]
    List {},
    #[command(about = "Track an app against a daily goal")]
    Track {
        package: String,
        #[arg(help = "Allowed minutes per day")]
        minutes: u32,
    },
    #[command(about = "Stop tracking an app. Its goal is dropped")]
    Untrack { package: String },
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let dir = resolve_data_dir(args.dir)?;
    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };
    enable_logging(&dir, logging_level, args.log)?;

    let services = Services::build(&dir)?;

    match args.commands {
        Commands::Login { user } => login(&services, user).await,
        Commands::Logout {} => {
            let session = open_session(&services).await?;
            let uid = session.uid().clone();
            session.logout().await?;
            println!("Signed out {uid}");
            Ok(())
        }
        Commands::Today {} => report::process_today_command(&services).await,
        Commands::Day { command } => report::process_day_command(&services, command).await,
        Commands::Calendar { command } => {
            report::process_calendar_command(&services, command).await
        }
        Commands::Apps(command) => process_apps_command(&services, command).await,
        Commands::Goal { minutes, clear } => process_goal_command(&services, minutes, clear).await,
        Commands::Sync {} => {
            let session = open_session(&services).await?;
            let report = session.sync().await;
            println!("Pulled: {}", report.pulled.join(", "));
            if !report.is_complete() {
                println!("Failed: {}", report.failed.join(", "));
            }
            Ok(())
        }
        Commands::Track {} => track::process_track_command(&services).await,
        Commands::Friends(command) => social::process_friends_command(&services, command).await,
        Commands::Groups(command) => social::process_groups_command(&services, command).await,
    }
}

/// Store and provider handles every command starts from.
pub struct Services {
    pub local: Arc<LocalStore>,
    pub remote: Arc<FsRemoteStore>,
    pub auth: Arc<LocalAuth>,
    pub usage_stats: Arc<EventLogUsageStats>,
    pub clock: Arc<DefaultClock>,
}

impl Services {
    /// Wires the file-backed implementations under the data directory. The
    /// `remote` subtree stands in for the hosted document store.
    fn build(dir: &Path) -> Result<Self> {
        let clock = Arc::new(DefaultClock);
        Ok(Self {
            local: Arc::new(LocalStore::new(dir.join("local"))?),
            remote: Arc::new(FsRemoteStore::new(dir.join("remote"), clock.clone())?),
            auth: Arc::new(LocalAuth::new(dir)?),
            usage_stats: Arc::new(EventLogUsageStats::new(dir.join("events"))?),
            clock,
        })
    }

    fn dependencies(&self) -> Dependencies {
        Dependencies {
            local: self.local.clone(),
            remote: self.remote.clone(),
            auth: self.auth.clone(),
            usage_stats: self.usage_stats.clone(),
            catalog: Arc::new(PlainCatalog),
            clock: self.clock.clone(),
        }
    }
}

fn resolve_data_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
    match dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)?;
            Ok(dir)
        }
        None => create_application_default_path(),
    }
}

/// Session of the currently signed-in user, or an instruction to log in.
async fn open_session(services: &Services) -> Result<Session> {
    let Some(user) = services.auth.current_user() else {
        bail!("No user is signed in. Run `pixeldiet login` first.");
    };
    Ok(Session::open(services.dependencies(), user).await)
}

async fn login(services: &Services, credential: Option<String>) -> Result<()> {
    if let Some(user) = services.auth.current_user() {
        println!("Already signed in as {}", user.uid);
        return Ok(());
    }

    let user = match credential {
        Some(credential) => services.auth.sign_in_with_credential(&credential).await?,
        None => services.auth.sign_in_anonymously().await?,
    };
    println!("Signed in as {}", user.uid);

    let session = Session::open(services.dependencies(), user).await;
    let report = session.sync().await;
    if !report.is_complete() {
        println!("Partial sync, failed: {}", report.failed.join(", "));
    }
    if let Some(profile) = session.profile().await? {
        println!("Friend code: {}", profile.friend_code);
    }
    Ok(())
}

async fn process_apps_command(services: &Services, command: AppsCommand) -> Result<()> {
    let session = open_session(services).await?;
    match command {
        AppsCommand::List {} => {
            let tracked = session.tracked_apps().await;
            if tracked.is_empty() {
                println!("Nothing is tracked. Add apps with `pixeldiet apps track`.");
                return Ok(());
            }
            for app in tracked {
                println!(
                    "{}\t{}",
                    app.package_name,
                    report::format_minutes(app.goal_time)
                );
            }
            Ok(())
        }
        AppsCommand::Track { package, minutes } => {
            let mut goals = goal_map(&session).await;
            goals.insert(package.as_str().into(), minutes);
            let refresh = session.set_tracked_apps(goals).await?;
            println!(
                "Tracking {package} at {} per day",
                report::format_minutes(minutes)
            );
            refresh.persist.await?;
            Ok(())
        }
        AppsCommand::Untrack { package } => {
            let mut goals = goal_map(&session).await;
            if goals.remove(package.as_str()).is_none() {
                println!("{package} was not tracked");
                return Ok(());
            }
            let refresh = session.set_tracked_apps(goals).await?;
            println!("Stopped tracking {package}");
            refresh.persist.await?;
            Ok(())
        }
    }
}

async fn goal_map(session: &Session) -> BTreeMap<Arc<str>, u32> {
    session
        .tracked_apps()
        .await
        .into_iter()
        .map(|app| (app.package_name, app.goal_time))
        .collect()
}

/// The total goal lives in session state, so this evaluates today within
/// one invocation rather than storing anything.
async fn process_goal_command(
    services: &Services,
    minutes: Option<u32>,
    clear: bool,
) -> Result<()> {
    let session = open_session(services).await?;
    if clear {
        session.set_overall_goal(None).await;
    } else if minutes.is_some() {
        session.set_overall_goal(minutes).await;
    }

    let refresh = session.refresh_today().await;
    let goal = session.overall_goal().await;
    let total = refresh.view.total_minutes();
    println!(
        "Today: {} of {} ({})",
        report::format_minutes(total),
        report::format_minutes(goal),
        report::status_label(day_status(total, goal))
    );
    refresh.persist.await?;
    Ok(())
}

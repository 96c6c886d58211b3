use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use notegraph::{
    IndexState, OpDispatcher, OpOutput, OpPreset, Operation, OrphanDirection, SearchScope, Vault,
    VaultEvent, VaultPath, VaultService,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ScopeArg {
    Metadata,
    Content,
    Entities,
    All,
}

impl From<ScopeArg> for SearchScope {
    fn from(value: ScopeArg) -> Self {
        match value {
            ScopeArg::Metadata => SearchScope::Metadata,
            ScopeArg::Content => SearchScope::Content,
            ScopeArg::Entities => SearchScope::Entities,
            ScopeArg::All => SearchScope::All,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DirectionArg {
    Incoming,
    Outgoing,
    Both,
}

impl From<DirectionArg> for OrphanDirection {
    fn from(value: DirectionArg) -> Self {
        match value {
            DirectionArg::Incoming => OrphanDirection::Incoming,
            DirectionArg::Outgoing => OrphanDirection::Outgoing,
            DirectionArg::Both => OrphanDirection::Both,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
    Plain,
    Bullet,
    TimestampBullet,
    Task,
}

impl From<FormatArg> for notegraph::WriteFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Plain => notegraph::WriteFormat::Plain,
            FormatArg::Bullet => notegraph::WriteFormat::Bullet,
            FormatArg::TimestampBullet => notegraph::WriteFormat::TimestampBullet,
            FormatArg::Task => notegraph::WriteFormat::Task,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VerdictArg {
    Correct,
    Incorrect,
}

impl From<VerdictArg> for notegraph::FeedbackVerdict {
    fn from(value: VerdictArg) -> Self {
        match value {
            VerdictArg::Correct => notegraph::FeedbackVerdict::Correct,
            VerdictArg::Incorrect => notegraph::FeedbackVerdict::Incorrect,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "notegraph",
    version,
    about = "Markdown vault indexing, querying and safe mutation"
)]
struct Cli {
    /// Vault root directory.
    #[arg(long, env = "NOTEGRAPH_VAULT", default_value = ".")]
    vault: PathBuf,

    /// Operation preset: comma-separated categories or bundles
    /// (all, minimal, read, write, search, backlinks, notes, tasks, graph,
    /// health, feedback, mutation, resources).
    #[arg(long, env = "NOTEGRAPH_OPS", default_value = "all")]
    ops: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the index and watch the vault until interrupted.
    Watch,
    /// Force a cold rebuild, print stats, and exit.
    Rebuild,
    /// Search notes.
    Search {
        query: String,
        #[arg(long, value_enum, default_value_t = ScopeArg::All)]
        scope: ScopeArg,
        #[arg(long)]
        tag: Option<String>,
        #[arg(long)]
        folder: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Inbound links for a note.
    Backlinks { path: String },
    /// Outbound links for a note.
    Outlinks { path: String },
    /// Frontmatter, tags, outline and counts for a note.
    Metadata { path: String },
    /// Raw body of one section.
    Section { path: String, section: String },
    /// Most-linked notes.
    Hubs {
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },
    /// Notes without links.
    Orphans {
        #[arg(long, value_enum, default_value_t = DirectionArg::Both)]
        direction: DirectionArg,
    },
    /// Shortest link path between two notes.
    Path {
        from: String,
        to: String,
        #[arg(long)]
        weighted: bool,
    },
    /// Frontmatter fields with types and counts.
    Schema,
    /// Ranked wikilink candidates for a note.
    Suggest {
        path: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Append content to a section.
    Add {
        path: String,
        section: String,
        content: String,
        #[arg(long, value_enum, default_value_t = FormatArg::Plain)]
        format: FormatArg,
    },
    /// Update frontmatter keys from a JSON object.
    SetFrontmatter { path: String, updates: String },
    /// Create a new note.
    Create {
        path: String,
        #[arg(long, default_value = "")]
        content: String,
    },
    /// Rename a note, rewriting backlinks.
    Rename {
        old: String,
        new: String,
        #[arg(long, default_value_t = true)]
        update_backlinks: bool,
    },
    /// Delete a note.
    Delete {
        path: String,
        #[arg(long)]
        force: bool,
    },
    /// Toggle a task checkbox.
    ToggleTask { path: String, line: u32 },
    /// Run a JSON array of chained mutation steps.
    Policy { steps: String },
    /// Report a wikilink verdict.
    Feedback {
        target: String,
        context: String,
        #[arg(value_enum)]
        verdict: VerdictArg,
    },
    /// Aggregated feedback rows.
    FeedbackList {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Vault statistics.
    Stats,
    /// Recently modified notes.
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Write the entities.json projection.
    Entities,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("notegraph=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let vault = Vault::open(&cli.vault)?;
    let preset = OpPreset::parse(&cli.ops)?;

    let mut service = VaultService::new(vault)?;
    service.build_index().await?;

    match cli.command {
        Command::Watch => {
            service.start_watching().await?;
            let mut events = service.subscribe();
            eprintln!("watching {} (ctrl-c to stop)", cli.vault.display());
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    ev = events.recv() => match ev {
                        Ok(VaultEvent::Indexed { path }) => eprintln!("indexed {path}"),
                        Ok(VaultEvent::Removed { path }) => eprintln!("removed {path}"),
                        Ok(VaultEvent::StateChanged { state }) => eprintln!("state: {state}"),
                        Ok(VaultEvent::WatchModeChanged { mode }) => {
                            eprintln!("watch mode: {mode:?}")
                        }
                        Ok(VaultEvent::Error { path, error }) => {
                            eprintln!("error ({path:?}): {error}")
                        }
                        Err(_) => break,
                    },
                }
            }
            service.shutdown().await;
            return Ok(());
        }
        Command::Rebuild => {
            service.build_index().await?;
            let dispatcher = OpDispatcher::new(&service, preset);
            print_output(dispatcher.dispatch(Operation::GetVaultStats)?)?;
            return Ok(());
        }
        command => {
            if service.state() != IndexState::Ready {
                anyhow::bail!("index is not ready: {}", service.state());
            }
            let dispatcher = OpDispatcher::new(&service, preset);
            let op = to_operation(command)?;
            let out = dispatcher.dispatch(op)?;
            let policy_failed = matches!(&out, OpOutput::Policy(r) if !r.ok);
            print_output(out)?;
            if policy_failed {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}

fn to_operation(command: Command) -> anyhow::Result<Operation> {
    let path = |s: &str| -> anyhow::Result<VaultPath> { Ok(VaultPath::try_from(s)?) };
    Ok(match command {
        Command::Watch | Command::Rebuild => unreachable!("handled by caller"),
        Command::Search {
            query,
            scope,
            tag,
            folder,
            limit,
        } => Operation::SearchNotes {
            query,
            scope: scope.into(),
            tag,
            folder,
            limit,
        },
        Command::Backlinks { path: p } => Operation::GetBacklinks { path: path(&p)? },
        Command::Outlinks { path: p } => Operation::GetOutlinks { path: path(&p)? },
        Command::Metadata { path: p } => Operation::GetNoteMetadata { path: path(&p)? },
        Command::Section { path: p, section } => Operation::GetSectionContent {
            path: path(&p)?,
            section,
        },
        Command::Hubs { top_k } => Operation::FindHubNotes { top_k },
        Command::Orphans { direction } => Operation::FindOrphanNotes {
            direction: direction.into(),
        },
        Command::Path { from, to, weighted } => Operation::GetShortestPath {
            from: path(&from)?,
            to: path(&to)?,
            weighted,
        },
        Command::Schema => Operation::GetFrontmatterSchema,
        Command::Suggest { path: p, limit } => Operation::SuggestWikilinks {
            path: path(&p)?,
            limit,
        },
        Command::Add {
            path: p,
            section,
            content,
            format,
        } => Operation::VaultAddToSection {
            path: path(&p)?,
            section,
            content,
            format: format.into(),
            position: notegraph::InsertPosition::End,
        },
        Command::SetFrontmatter { path: p, updates } => Operation::VaultUpdateFrontmatter {
            path: path(&p)?,
            updates: serde_json::from_str::<serde_yaml::Mapping>(&updates)?,
        },
        Command::Create { path: p, content } => Operation::VaultCreateNote {
            path: path(&p)?,
            frontmatter: None,
            content,
        },
        Command::Rename {
            old,
            new,
            update_backlinks,
        } => Operation::VaultRenameNote {
            old: path(&old)?,
            new: path(&new)?,
            update_backlinks,
        },
        Command::Delete { path: p, force } => Operation::VaultDeleteNote {
            path: path(&p)?,
            force,
        },
        Command::ToggleTask { path: p, line } => Operation::VaultToggleTask {
            path: path(&p)?,
            line,
        },
        Command::Policy { steps } => Operation::VaultRunPolicy {
            steps: serde_json::from_str(&steps)?,
        },
        Command::Feedback {
            target,
            context,
            verdict,
        } => Operation::ReportWikilinkFeedback {
            target,
            context,
            verdict: verdict.into(),
        },
        Command::FeedbackList { limit } => Operation::ListWikilinkFeedback { limit },
        Command::Stats => Operation::GetVaultStats,
        Command::Recent { limit } => Operation::GetRecentNotes { limit },
        Command::Entities => Operation::ExportEntities,
    })
}

fn print_output(out: OpOutput) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use covengine::cli::{self, CompareArgs, ImportArgs};
use covengine::db;
use covengine::diff::{DiffSource, FileDiff, GitDiff, StdinDiff};
use covengine::storage::FsStorage;
use covengine::tree::{OrderingDirection, OrderingParameter};

/// covengine: assemble, filter and compare chunked coverage reports.
#[derive(Parser)]
#[command(name = "covengine", version, about)]
struct Cli {
    /// Path to the SQLite metadata database.
    #[arg(long, global = true, env = "COVENGINE_DB", default_value = ".covengine.db")]
    db: PathBuf,

    /// Root directory of the report archive.
    #[arg(
        long,
        global = true,
        env = "COVENGINE_ARCHIVE",
        default_value = ".covengine-archive"
    )]
    archive: PathBuf,

    /// Archive layout version used in storage keys.
    #[arg(long, global = true, default_value = "v4")]
    chunks_version: String,

    /// Repository name.
    #[arg(long, global = true, default_value = "default")]
    repo: String,

    /// Enable debug logging (RUST_LOG takes precedence).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a commit's chunks blob and report index.
    Import {
        /// Commit SHA.
        commit: String,

        /// Path to the chunks.txt blob.
        #[arg(long)]
        chunks: PathBuf,

        /// Path to the report index JSON (files and sessions).
        #[arg(long)]
        index: PathBuf,

        /// Parent commit SHA.
        #[arg(long)]
        parent: Option<String>,

        #[arg(long)]
        branch: Option<String>,

        /// Archive directory name of the repository.
        #[arg(long, env = "COVENGINE_REPO_HASH")]
        repo_hash: String,
    },

    /// Show report totals for a commit.
    Summary {
        commit: String,

        /// Only count sessions carrying one of these flags.
        #[arg(long = "flag")]
        flags: Vec<String>,
    },

    /// List per-file coverage for a commit.
    Files {
        commit: String,

        #[arg(long = "flag")]
        flags: Vec<String>,

        /// Sort by coverage ascending (show worst files first).
        #[arg(long)]
        sort_by_coverage: bool,
    },

    /// Show line-level coverage for a source file.
    Lines {
        commit: String,

        /// The source file path as stored in the report.
        source_file: String,

        #[arg(long = "flag")]
        flags: Vec<String>,

        /// Only list lines that are not fully covered.
        #[arg(long)]
        uncovered: bool,
    },

    /// Print the file tree of a commit as JSON.
    Tree {
        commit: String,

        #[arg(long = "flag")]
        flags: Vec<String>,

        /// Only show files below this directory.
        #[arg(long, default_value = "")]
        path: String,

        /// Flat list of files whose path contains this text.
        #[arg(long)]
        search: Option<String>,

        #[arg(long, value_enum)]
        order: Option<OrderingParameter>,

        #[arg(long, value_enum, default_value = "asc")]
        direction: OrderingDirection,
    },

    /// Compare a commit with its parent, or with a pull request base.
    Compare {
        commit: String,

        /// Base commit of a pull request.
        #[arg(long)]
        base: Option<String>,

        /// The pull request is the author's first.
        #[arg(long)]
        first_pull: bool,

        /// Read a unified diff from this file ("-" for stdin).
        #[arg(long, conflicts_with = "git_diff")]
        diff: Option<PathBuf>,

        /// Git diff arguments, e.g. "HEAD~1" or "main..HEAD".
        #[arg(long)]
        git_diff: Option<String>,

        /// Path prefix to prepend to diff paths for matching report paths.
        #[arg(long)]
        path_prefix: Option<String>,

        /// Store the impacted-files payload in the archive.
        #[arg(long)]
        save: bool,
    },

    /// List impacted files stored for a base/head pair.
    Impacted { base: String, head: String },

    /// Show coverage per component defined in a repository YAML file.
    Components {
        commit: String,

        /// Path to the repository YAML (e.g. codecov.yml).
        #[arg(long)]
        config: PathBuf,

        /// Only these component ids.
        #[arg(long = "component")]
        components: Vec<String>,
    },
}

fn init_logging(verbose: bool) {
    // RUST_LOG in the environment always takes precedence; --verbose falls back to DEBUG.
    let filter = if verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

fn read_diff(diff: Option<PathBuf>, git_diff: Option<String>) -> Result<Option<String>> {
    let source: Box<dyn DiffSource> = match (diff, git_diff) {
        (Some(path), _) if path.as_os_str() == "-" => Box::new(StdinDiff),
        (Some(path), _) => Box::new(FileDiff { path }),
        (None, Some(args)) => Box::new(GitDiff { args }),
        (None, None) => return Ok(None),
    };
    source.fetch_diff().map(Some)
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_logging(args.verbose);

    let mut conn = db::open(&args.db).context("Failed to open database")?;
    db::init_schema(&conn).context("Failed to initialize schema")?;
    let storage = FsStorage::new(&args.archive);
    let version = args.chunks_version.as_str();
    let repo = args.repo.as_str();

    let output = match args.command {
        Commands::Import {
            commit,
            chunks,
            index,
            parent,
            branch,
            repo_hash,
        } => cli::cmd_import(
            &mut conn,
            &storage,
            version,
            &ImportArgs {
                repository: repo,
                repo_hash: &repo_hash,
                commitid: &commit,
                parent: parent.as_deref(),
                branch: branch.as_deref(),
                chunks: &chunks,
                index: &index,
            },
        )?,
        Commands::Summary { commit, flags } => {
            cli::cmd_summary(&conn, &storage, version, repo, &commit, &flags)?
        }
        Commands::Files {
            commit,
            flags,
            sort_by_coverage,
        } => cli::cmd_files(&conn, &storage, version, repo, &commit, &flags, sort_by_coverage)?,
        Commands::Lines {
            commit,
            source_file,
            flags,
            uncovered,
        } => cli::cmd_lines(
            &conn,
            &storage,
            version,
            repo,
            &commit,
            &source_file,
            &flags,
            uncovered,
        )?,
        Commands::Tree {
            commit,
            flags,
            path,
            search,
            order,
            direction,
        } => cli::cmd_tree(
            &conn,
            &storage,
            version,
            repo,
            &commit,
            &flags,
            &path,
            search.as_deref(),
            order.map(|o| (o, direction)),
        )?,
        Commands::Compare {
            commit,
            base,
            first_pull,
            diff,
            git_diff,
            path_prefix,
            save,
        } => {
            let diff_text = read_diff(diff, git_diff)?;
            cli::cmd_compare(
                &conn,
                &storage,
                version,
                &CompareArgs {
                    repository: repo,
                    commitid: &commit,
                    base: base.as_deref(),
                    first_pull,
                    diff_text: diff_text.as_deref(),
                    path_prefix: path_prefix.as_deref(),
                    save,
                },
            )?
        }
        Commands::Impacted { base, head } => cli::cmd_impacted(&conn, &storage, repo, &base, &head)?,
        Commands::Components {
            commit,
            config,
            components,
        } => cli::cmd_components(&conn, &storage, version, repo, &commit, &config, &components)?,
    };

    print!("{output}");
    Ok(())
}

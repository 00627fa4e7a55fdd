//! expctl CLI entry point

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use expctl::build::{make_builds, Phase, PhaseRequest};
use expctl::config::Config;
use expctl::instances::{install_instances, GeneratorProvider};
use expctl::launch::{invoke_specfile, ClusterLauncher, Launcher};
use expctl::matrix::expand_runs;
use expctl::queue::{self, client};
use expctl::run::purge_run;
use expctl::{Context, Run, ScopeNode, StatusCache};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "expctl", version)]
#[command(about = "Expand, build, launch and track computational experiments", long_about = None)]
struct Cli {
    /// Directory containing experiments.yml
    #[arg(short = 'C', long = "directory", default_value = ".", global = true)]
    directory: PathBuf,

    /// Log debug messages
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Queue daemon socket (default: $EXPCTL_QUEUE_SOCKET or ~/.extlq.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage instances
    #[command(subcommand)]
    Instances(InstancesCommand),
    /// Manage experiments and their runs
    #[command(subcommand)]
    Experiments(ExperimentsCommand),
    /// Manage builds
    #[command(subcommand)]
    Builds(BuildsCommand),
    /// Control the local queue daemon
    #[command(subcommand)]
    Queue(QueueCommand),
    /// Execute a stored spec file (used by queue workers and cluster jobs)
    #[command(hide = true)]
    InternalInvoke {
        /// Index of the manifest inside an array spec file
        #[arg(long)]
        array_index: Option<usize>,
        /// Read the array index from this environment variable
        #[arg(long)]
        array_index_env: Option<String>,
        specfile: PathBuf,
    },
}

#[derive(Subcommand)]
enum InstancesCommand {
    /// List instances and whether their files are present
    List,
    /// Materialize missing instances
    Install,
}

#[derive(clap::Args)]
struct Filter {
    /// Restrict to these experiments
    #[arg(long = "experiment", short = 'e')]
    experiments: Vec<String>,
    /// Restrict to these revisions
    #[arg(long = "revision", short = 'r')]
    revisions: Vec<String>,
    /// Restrict to these instance sets
    #[arg(long = "instset")]
    instsets: Vec<String>,
}

impl Filter {
    fn scope(&self, cfg: &Config) -> ScopeNode {
        let mut root = ScopeNode::all();
        if !self.experiments.is_empty() {
            root = root.experiments(self.experiments.iter().cloned());
        }
        if !self.revisions.is_empty() {
            root = root.revisions(self.revisions.iter().cloned());
        }
        if !self.instsets.is_empty() {
            root = root.instsets(self.instsets.iter().cloned());
        }
        root.child(ScopeNode::from_config(cfg))
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum LauncherKind {
    Fork,
    Queue,
    Cluster,
}

#[derive(Subcommand)]
enum ExperimentsCommand {
    /// List experiments, or every run with --full
    List {
        #[arg(long)]
        full: bool,
        #[command(flatten)]
        filter: Filter,
    },
    /// Launch runs that were not submitted yet
    Launch {
        #[arg(long, value_enum, default_value = "fork")]
        launcher: LauncherKind,
        /// Submission command of the cluster launcher
        #[arg(long, default_value = "sbatch")]
        submit_cmd: String,
        /// Cluster partition
        #[arg(long)]
        partition: Option<String>,
        #[command(flatten)]
        filter: Filter,
    },
    /// Remove markers and outputs so runs can be launched again
    Purge {
        /// Purge runs that timed out, were killed or failed
        #[arg(long, conflicts_with = "all")]
        failed: bool,
        /// Purge every run
        #[arg(long)]
        all: bool,
        #[command(flatten)]
        filter: Filter,
    },
}

#[derive(Subcommand)]
enum BuildsCommand {
    /// Build and install program revisions
    Make {
        /// Revisions to build; all revisions if omitted
        #[arg(long = "revision", short = 'r')]
        revisions: Vec<String>,
        #[arg(long)]
        recheckout: bool,
        #[arg(long)]
        reregenerate: bool,
        #[arg(long)]
        reconfigure: bool,
        #[arg(long)]
        recompile: bool,
        #[arg(long)]
        reinstall: bool,
        /// Builds to make; everything experiments use if omitted
        names: Vec<String>,
    },
}

#[derive(Subcommand)]
enum QueueCommand {
    /// Run the queue daemon in the foreground
    Daemon {
        /// Remove a stale socket left by a crashed daemon
        #[arg(long)]
        force: bool,
    },
    /// Show the in-flight and pending runs
    Show,
    /// Show the status codes of queued jobs
    Status,
    /// Finish pending runs, then exit
    Stop,
    /// Kill the in-flight run and exit
    Kill,
}

fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}

fn load_config(dir: &Path) -> Result<Config> {
    Config::from_dir(dir).with_context(|| format!("Failed to load configuration from {}", dir.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut ctx = Context::default();
    if let Some(socket) = &cli.socket {
        ctx = ctx.with_queue_socket(socket);
    }

    match cli.command {
        Commands::Instances(cmd) => instances(&cli.directory, cmd),
        Commands::Experiments(cmd) => experiments(&cli.directory, cmd, &ctx),
        Commands::Builds(cmd) => builds(&cli.directory, cmd),
        Commands::Queue(cmd) => queue_command(cmd, &ctx),
        Commands::InternalInvoke {
            array_index,
            array_index_env,
            specfile,
        } => {
            let index = match (array_index, array_index_env) {
                (Some(i), _) => Some(i),
                (None, Some(var)) => {
                    let value = std::env::var(&var).with_context(|| format!("${} is not set", var))?;
                    Some(value.trim().parse::<usize>().with_context(|| format!("${} is not an index", var))?)
                }
                (None, None) => None,
            };
            let doc = block_on(invoke_specfile(&specfile, index, &ctx))??;
            log::debug!("Run published status {}", doc.status());
            Ok(())
        }
    }
}

fn instances(dir: &Path, cmd: InstancesCommand) -> Result<()> {
    let cfg = load_config(dir)?;
    match cmd {
        InstancesCommand::List => {
            let instance_dir = cfg.instance_dir();
            for instance in cfg.all_instances() {
                let state = if instance.is_fileless() {
                    "fileless"
                } else if instance.check_available(&instance_dir) {
                    "available"
                } else {
                    "missing"
                };
                println!("{:<40} {}", instance.yml_name, state);
            }
        }
        InstancesCommand::Install => {
            let installed = install_instances(&cfg, &[&GeneratorProvider])?;
            println!("Installed {} instances", installed.len());
        }
    }
    Ok(())
}

fn select_runs<'a>(cfg: &'a Config, filter: &Filter) -> Result<Vec<Run<'a>>> {
    Ok(expand_runs(cfg, &filter.scope(cfg))?)
}

fn experiments(dir: &Path, cmd: ExperimentsCommand, ctx: &Context) -> Result<()> {
    let cfg = load_config(dir)?;
    match cmd {
        ExperimentsCommand::List { full, filter } => {
            let runs = select_runs(&cfg, &filter)?;
            let mut cache = StatusCache::load(cfg.base_dir());
            if full {
                for run in &runs {
                    let status = cache.status(&run.identity());
                    println!("{:<60} {}", run.display_name(), status);
                }
            } else {
                let mut summary: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
                for run in &runs {
                    let status = cache.status(&run.identity());
                    *summary
                        .entry(run.experiment.display_name())
                        .or_default()
                        .entry(status.to_string())
                        .or_default() += 1;
                }
                for (experiment, counts) in summary {
                    let counts: Vec<String> = counts.iter().map(|(s, n)| format!("{} {}", n, s)).collect();
                    println!("{:<50} {}", experiment, counts.join(", "));
                }
            }
            cache.save()?;
        }
        ExperimentsCommand::Launch {
            launcher,
            submit_cmd,
            partition,
            filter,
        } => {
            let runs = select_runs(&cfg, &filter)?;
            let launcher = match launcher {
                LauncherKind::Fork => Launcher::Fork,
                LauncherKind::Queue => Launcher::Queue,
                LauncherKind::Cluster => {
                    let words: Vec<String> = submit_cmd.split_whitespace().map(str::to_string).collect();
                    let mut cluster = ClusterLauncher::new(words);
                    if let Some(partition) = partition {
                        cluster = cluster.with_partition(partition);
                    }
                    Launcher::Cluster(cluster)
                }
            };
            let submitted = block_on(launcher.submit_multiple(&cfg, &runs, ctx))??;
            println!("Submitted {} of {} runs", submitted, runs.len());
        }
        ExperimentsCommand::Purge { failed, all, filter } => {
            if !failed && !all {
                bail!("Specify --failed or --all");
            }
            let runs = select_runs(&cfg, &filter)?;
            let mut cache = StatusCache::load(cfg.base_dir());
            let mut purged = 0;
            for run in &runs {
                let id = run.identity();
                let status = cache.status(&id);
                if all || status.is_negative() {
                    purge_run(cfg.base_dir(), &id, &run.experiment.info.output_extensions)?;
                    purged += 1;
                }
            }
            cache.save()?;
            println!("Purged {} runs", purged);
        }
    }
    Ok(())
}

fn builds(dir: &Path, cmd: BuildsCommand) -> Result<()> {
    let cfg = load_config(dir)?;
    match cmd {
        BuildsCommand::Make {
            revisions,
            recheckout,
            reregenerate,
            reconfigure,
            recompile,
            reinstall,
            names,
        } => {
            let flags = [
                (recheckout, Phase::Checkout),
                (reregenerate, Phase::Regenerate),
                (reconfigure, Phase::Configure),
                (recompile, Phase::Compile),
                (reinstall, Phase::Install),
            ];
            let requested: Vec<Phase> = flags.iter().filter(|(on, _)| *on).map(|(_, p)| *p).collect();

            let names = if names.is_empty() {
                let mut used: Vec<String> = cfg
                    .all_experiment_infos()
                    .flat_map(|e| e.used_builds().iter().cloned())
                    .collect();
                used.sort();
                used.dedup();
                used
            } else {
                names
            };
            if names.is_empty() {
                println!("Nothing to build");
                return Ok(());
            }

            let revisions = if revisions.is_empty() {
                cfg.all_revisions().collect::<Vec<_>>()
            } else {
                revisions
                    .iter()
                    .map(|r| cfg.get_revision(r))
                    .collect::<expctl::Result<Vec<_>>>()?
            };
            for revision in revisions {
                log::info!("Making builds of revision {}", revision.name);
                make_builds(&cfg, revision, &names, PhaseRequest::new(requested.iter().copied()))?;
            }
        }
    }
    Ok(())
}

fn queue_command(cmd: QueueCommand, ctx: &Context) -> Result<()> {
    let socket = &ctx.queue_socket;
    match cmd {
        QueueCommand::Daemon { force } => queue::run_daemon(ctx, force)?,
        QueueCommand::Show => {
            let show = client::show(socket)?;
            match show.current_run {
                Some(current) => println!("Current: {}", current),
                None => println!("Current: (idle)"),
            }
            for pending in &show.pending_runs {
                println!("Pending: {}", pending);
            }
            println!("Completed: {}", show.num_completed_runs);
        }
        QueueCommand::Status => {
            for (job, code) in client::job_status_dict(socket)? {
                let status = expctl::Status::from_code(code)
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| code.to_string());
                println!("{:<40} {}", job, status);
            }
        }
        QueueCommand::Stop => client::stop(socket)?,
        QueueCommand::Kill => client::kill(socket)?,
    }
    Ok(())
}

//! cellnas CLI Module
//!
//! Command-line interface for inspecting search spaces, running forward
//! passes and converting between architecture weights and genotypes.

use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use ndarray::{Array2, Array4};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::layers::Phase;
use crate::nas::{build_space, encode, Genotype, SearchSpace, SpaceConfig, SpaceKind};

// ─── Styling helpers ───────────────────────────────────────────────────────────

fn dim(s: &str) -> ColoredString   { s.truecolor(100, 100, 100) }
fn accent(s: &str) -> ColoredString { s.truecolor(120, 170, 255) }
fn muted(s: &str) -> ColoredString  { s.truecolor(140, 140, 140) }
fn ok(s: &str) -> ColoredString     { s.truecolor(100, 210, 120) }

fn kv(key: &str, val: &str) {
    println!("  {:<18} {}", muted(key), val.white());
}

fn step_run(msg: &str) {
    print!("  {} {}... ", accent("›"), msg);
}

fn step_done(detail: &str) {
    println!("{} {}", ok("done"), dim(detail));
}

fn section(title: &str) {
    println!();
    println!("  {}", title.white().bold());
    println!("  {}", dim(&"─".repeat(56)));
}

// ─── CLI definition ────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "cellnas")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Cell-based differentiable NAS search spaces")]
#[command(long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Options shared by every command that builds a search space
#[derive(Args, Debug, Clone)]
pub struct SpaceArgs {
    /// JSON configuration file; flags below override its fields
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Search space (darts, gdas, gdas_frc, nas_bench_201)
    #[arg(short, long)]
    pub space: Option<String>,

    /// Base channel width
    #[arg(long)]
    pub channels: Option<usize>,

    /// Stacked cells (NAS-Bench-201: cells per stage)
    #[arg(long)]
    pub layers: Option<usize>,

    /// Nodes per cell
    #[arg(long)]
    pub nodes: Option<usize>,

    /// Seed for weight initialisation
    #[arg(long, default_value = "0")]
    pub seed: u64,
}

impl SpaceArgs {
    pub fn to_config(&self) -> anyhow::Result<SpaceConfig> {
        let mut config = match (&self.config, &self.space) {
            (Some(path), _) => SpaceConfig::from_json_file(path)?,
            (None, Some(space)) => SpaceConfig::new(space.parse::<SpaceKind>()?),
            (None, None) => SpaceConfig::default(),
        };
        if let (Some(_), Some(space)) = (&self.config, &self.space) {
            config.space = space.parse()?;
        }
        if let Some(c) = self.channels {
            config.channels = c;
        }
        if let Some(l) = self.layers {
            config.layers = l;
        }
        if let Some(n) = self.nodes {
            config.nodes = n;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Forward evaluation path
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ForwardMode {
    /// Skip zero-weight primitives, scale the rest
    Relaxed,
    /// Run every primitive, scale by its weight
    Soft,
    /// Gumbel-softmax hard selection
    Gdas,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show a search space summary
    Info {
        #[command(flatten)]
        space: SpaceArgs,
    },

    /// Run a random batch through a search network
    Forward {
        #[command(flatten)]
        space: SpaceArgs,

        /// Batch size
        #[arg(short, long, default_value = "2")]
        batch: usize,

        /// Input height and width
        #[arg(long, default_value = "32")]
        size: usize,

        /// Evaluation path
        #[arg(short, long, value_enum, default_value = "relaxed")]
        mode: ForwardMode,

        /// Use running statistics instead of batch statistics
        #[arg(long)]
        eval: bool,
    },

    /// Decode an architecture-weight matrix (JSON rows) into a genotype
    Genotype {
        #[command(flatten)]
        space: SpaceArgs,

        /// Architecture weights, a JSON array of rows
        #[arg(short, long)]
        weights: PathBuf,

        /// Write the genotype as JSON (DARTS-style spaces only)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Encode a JSON genotype into a one-hot weight matrix
    Encode {
        #[command(flatten)]
        space: SpaceArgs,

        /// Genotype JSON file
        #[arg(short, long)]
        genotype: PathBuf,

        /// Output file; prints to stdout when absent
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

// ─── Matrix IO ────────────────────────────────────────────────────────────────

/// Read a JSON array of equally long rows
pub fn read_matrix(path: &Path) -> anyhow::Result<Array2<f64>> {
    let rows: Vec<Vec<f64>> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    let ncols = rows.first().map(Vec::len).unwrap_or(0);
    if rows.iter().any(|r| r.len() != ncols) {
        anyhow::bail!("rows of {} differ in length", path.display());
    }
    let nrows = rows.len();
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Ok(Array2::from_shape_vec((nrows, ncols), flat)?)
}

pub fn matrix_to_json(m: &Array2<f64>) -> anyhow::Result<String> {
    let rows: Vec<Vec<f64>> = m.outer_iter().map(|r| r.to_vec()).collect();
    Ok(serde_json::to_string_pretty(&rows)?)
}

fn softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    out
}

// ─── Commands ──────────────────────────────────────────────────────────────────

pub fn cmd_info(args: &SpaceArgs) -> anyhow::Result<()> {
    let config = args.to_config()?;
    section("Search space");

    step_run(&format!("Building {}", config.space.to_string().cyan()));
    let start = Instant::now();
    let space = build_space(&config, Some(args.seed))?;
    step_done(&format!("{:?}", start.elapsed()));

    println!();
    kv("Space", &space.kind().to_string());
    kv("Vocabulary", &space.vocabulary().to_string());
    kv("Channels", &config.channels.to_string());
    kv("Nodes", &config.nodes.to_string());
    kv("Weight rows", &space.all_edges().to_string());
    kv("Primitives", &space.num_ops().to_string());

    match &space {
        SearchSpace::Darts(net) => print_plan(net),
        SearchSpace::Gdas(net) => {
            kv("Tau", &format!("{}", net.tau()));
            print_plan(net.network());
        }
        SearchSpace::NasBench201(net) => {
            section("Edges");
            for (key, row) in net.edge2index() {
                println!("  {:>6} {}", muted(&row.to_string()), key);
            }
        }
    }
    println!();
    Ok(())
}

fn print_plan(net: &crate::nas::DartsNetwork) {
    section("Cells");
    println!(
        "  {:<6} {:>6} {:>6} {:>6} {:>6}  {}",
        muted("layer"),
        muted("C_pp"),
        muted("C_p"),
        muted("C"),
        muted("out"),
        muted("kind")
    );
    for (i, (plan, cell)) in net.channel_plan().iter().zip(net.cells()).enumerate() {
        let kind = match cell {
            crate::nas::StackedCell::Search(_) if plan.reduction => "reduce".yellow(),
            crate::nas::StackedCell::Search(_) => "normal".normal(),
            crate::nas::StackedCell::FixedReduction(_) => "fixed reduce".yellow(),
        };
        println!(
            "  {:<6} {:>6} {:>6} {:>6} {:>6}  {}",
            i,
            plan.c_pp,
            plan.c_p,
            plan.c_cur,
            cell.out_channels(),
            kind
        );
    }
}

pub fn cmd_forward(args: &SpaceArgs, batch: usize, size: usize, mode: ForwardMode, eval: bool) -> anyhow::Result<()> {
    let config = args.to_config()?;
    section("Forward");

    step_run("Building network");
    let mut space = build_space(&config, Some(args.seed))?;
    step_done(&format!("{} weight rows", space.all_edges()));

    let mut rng = Xoshiro256PlusPlus::seed_from_u64(args.seed.wrapping_add(1));
    let x = Array4::from_shape_fn((batch, config.input_channels, size, size), |_| rng.gen_range(-1.0..1.0));
    let logits = Array2::from_shape_fn((space.all_edges(), space.num_ops()), |_| rng.gen_range(-1e-3..1e-3));
    let phase = if eval { Phase::Eval } else { Phase::Train };

    step_run(&format!("Running {:?} path", mode));
    let start = Instant::now();
    let out = match mode {
        ForwardMode::Relaxed => space.forward(&x, softmax_rows(&logits).view(), phase)?,
        ForwardMode::Soft => space.forward_soft(&x, softmax_rows(&logits).view(), phase)?,
        ForwardMode::Gdas => space.forward_gdas(&x, logits.view(), phase, &mut rng)?,
    };
    step_done(&format!("{:?}", start.elapsed()));

    println!();
    kv("Input", &format!("{:?}", x.dim()));
    kv("Logits", &format!("{:?}", out.dim()));
    println!();
    Ok(())
}

pub fn cmd_genotype(args: &SpaceArgs, weights: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let config = args.to_config()?;
    let space = build_space(&config, Some(args.seed))?;
    let theta = read_matrix(weights)?;

    section("Genotype");
    println!("  {}", space.genotype_string(theta.view())?);

    if let Some(path) = output {
        let genotype = match &space {
            SearchSpace::Darts(net) => net.genotype(theta.view())?,
            SearchSpace::Gdas(net) => net.genotype(theta.view())?,
            SearchSpace::NasBench201(_) => anyhow::bail!("NAS-Bench-201 genotypes are strings only"),
        };
        std::fs::write(path, genotype.to_json()?)?;
        println!("  {} {}", ok("✓"), dim(&format!("saved → {}", path.display())));
    }
    println!();
    Ok(())
}

pub fn cmd_encode(args: &SpaceArgs, genotype: &Path, output: Option<&Path>) -> anyhow::Result<()> {
    let config = args.to_config()?;
    let genotype = Genotype::from_json(&std::fs::read_to_string(genotype)?)?;
    // an explicit node count (flag or config file) must agree with the genotype
    if (args.nodes.is_some() || args.config.is_some()) && config.nodes != genotype.n_nodes() {
        anyhow::bail!(
            "genotype has {} nodes per cell but {} were requested",
            genotype.n_nodes(),
            config.nodes
        );
    }
    let onehot = encode(&genotype, genotype.n_nodes(), &config.vocabulary()?)?;
    let json = matrix_to_json(&onehot)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)?;
            println!("  {} {}", ok("✓"), dim(&format!("{:?} one-hot → {}", onehot.dim(), path.display())));
        }
        None => println!("{}", json),
    }
    Ok(())
}

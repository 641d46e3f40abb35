//! `fsl` command-line tool.
//!
//!   fsl summary --config resnet18 --image-size 224
//!   fsl export-config --config conv4_no_classifier -o conv4.json
//!   fsl -v meta-step --deploy maml --steps 20 --shots 1

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use fsl::checkpoint;
use fsl::episode::{synthetic_task, EpisodeConfig};
use fsl::meta::config::{conv4_backbone, conv4_no_classifier, resnet18, resnet18_no_head};
use fsl::meta::LayerConfig;
use fsl::model::{get_model, ModelArgs};
use fsl::{CpuBackend, CpuDevice, DType, Error, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

#[derive(Parser)]
#[command(name = "fsl")]
#[command(about = "Few-shot classification with config-driven networks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the layer table, parameter slots and inferred shapes of a config
    Summary {
        /// Builtin config name or path to a JSON config
        #[arg(short, long, default_value = "conv4_no_classifier")]
        config: String,

        /// Square input resolution
        #[arg(long, default_value_t = 84)]
        image_size: usize,

        /// Input channels
        #[arg(long, default_value_t = 3)]
        channels: usize,

        /// Classes of the `resnet18` classifier
        #[arg(long, default_value_t = 5)]
        num_ways: usize,

        /// List every parameter slot
        #[arg(long)]
        slots: bool,
    },

    /// Write a builtin config as JSON
    ExportConfig {
        /// Builtin config name
        #[arg(short, long)]
        config: String,

        /// Classes of the `resnet18` classifier
        #[arg(long, default_value_t = 5)]
        num_ways: usize,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run meta-training steps on synthetic episodes
    MetaStep {
        /// JSON file with model arguments
        #[arg(long)]
        args: Option<PathBuf>,

        /// Deploy method (maml or resnet); overrides the arguments file
        #[arg(long)]
        deploy: Option<String>,

        /// Meta steps to run
        #[arg(long, default_value_t = 10)]
        steps: usize,

        /// Episodes per meta step
        #[arg(long, default_value_t = 4)]
        tasks: usize,

        /// Support examples per class
        #[arg(long, default_value_t = 1)]
        shots: usize,

        /// Query examples per class
        #[arg(long, default_value_t = 5)]
        queries: usize,

        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Save the meta parameters here afterwards
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

const BUILTIN_CONFIGS: [&str; 4] = ["conv4_no_classifier", "conv4", "resnet18_no_head", "resnet18"];

fn builtin_config(name: &str, num_ways: usize) -> Result<Option<LayerConfig>> {
    Ok(match name {
        "conv4_no_classifier" => Some(conv4_no_classifier()),
        "conv4" => Some(conv4_backbone(fsl::backbone::CONV4_HIDDEN)?),
        "resnet18_no_head" => Some(resnet18_no_head()),
        "resnet18" => Some(resnet18(num_ways)?),
        _ => None,
    })
}

fn resolve_config(name: &str, num_ways: usize) -> Result<LayerConfig> {
    if let Some(config) = builtin_config(name, num_ways)? {
        return Ok(config);
    }
    if Path::new(name).exists() {
        return Ok(LayerConfig::from_json_file(name)?);
    }
    Err(fsl::meta::Error::config(format!(
        "`{}` is neither a builtin config ({}) nor a file",
        name,
        BUILTIN_CONFIGS.join(", ")
    ))
    .into())
}

fn summary(config: &LayerConfig, input: [usize; 4], show_slots: bool) -> Result<()> {
    let layout = config.slot_layout()?;
    let shapes = config.infer_shapes(&input)?;

    println!("input {:?}", input);
    println!("{:>4}  {:<13} {:<24} {:<20} {:>5}", "#", "kind", "args", "output", "slots");
    for (i, spec) in config.iter().enumerate() {
        let args = spec.args().iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", ");
        println!(
            "{:>4}  {:<13} {:<24} {:<20} {:>5}",
            i,
            spec.kind().as_str(),
            format!("[{}]", args),
            format!("{:?}", shapes[i]),
            layout.ranges[i].len()
        );
    }
    let elements: usize = layout.slots.iter().map(|s| s.elem_count()).sum();
    let trainable: usize = layout
        .slots
        .iter()
        .filter(|s| s.role.is_trainable())
        .map(|s| s.elem_count())
        .sum();
    println!(
        "{} layers, {} slots, {} elements ({} trainable)",
        config.len(),
        layout.len(),
        elements,
        trainable
    );

    if show_slots {
        for (i, slot) in layout.slots.iter().enumerate() {
            println!("{:>4}  {:<40} {:<10} {:?}", i, slot.name, slot.role.as_str(), slot.dims);
        }
    }
    Ok(())
}

fn export_config(config: &LayerConfig, output: Option<&Path>) -> Result<()> {
    let json = config.to_json_pretty()?;
    match output {
        Some(path) => {
            let mut file = File::create(path)?;
            writeln!(file, "{}", json)?;
            info!(path = %path.display(), layers = config.len(), "config written");
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn read_args(path: &Path) -> Result<ModelArgs> {
    let reader = BufReader::new(File::open(path)?);
    serde_json::from_reader(reader).map_err(|e| {
        fsl::meta::Error::config(format!("{}: invalid model arguments: {}", path.display(), e)).into()
    })
}

struct MetaStepOptions {
    steps: usize,
    tasks: usize,
    shots: usize,
    queries: usize,
    seed: u64,
    save: Option<PathBuf>,
}

fn meta_step(args: ModelArgs, opts: MetaStepOptions) -> Result<()> {
    let registry = fsl::backbone::BackboneRegistry::<CpuBackend>::new();
    let mut model = get_model(&args, &registry, DType::F32, &CpuDevice)?;
    let deploy = args.deploy.clone();
    let learner = model.as_meta_mut().ok_or_else(|| Error::UnsupportedDeploy {
        deploy,
        reason: "meta-step needs the maml or resnet deploy".into(),
    })?;

    let episode = EpisodeConfig {
        n_way: args.num_ways,
        k_shot: opts.shots,
        n_query: opts.queries,
        image_dims: [3, args.image_size, args.image_size],
        ..EpisodeConfig::default()
    };
    let mut rng = StdRng::seed_from_u64(opts.seed);
    for _ in 0..opts.steps {
        let tasks = (0..opts.tasks)
            .map(|_| synthetic_task::<CpuBackend, _>(&mut rng, &episode, DType::F32, &CpuDevice))
            .collect::<Result<Vec<_>>>()?;
        let report = learner.meta_train_step(&tasks)?;
        let line = serde_json::to_string(&report)?;
        println!("{}", line);
    }

    if let Some(path) = &opts.save {
        checkpoint::save_params(path, learner.params())?;
        info!(path = %path.display(), slots = learner.params().len(), "meta parameters saved");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    fsl::logging::init(cli.verbose);

    match cli.command {
        Commands::Summary {
            config,
            image_size,
            channels,
            num_ways,
            slots,
        } => {
            let layers = resolve_config(&config, num_ways)?;
            summary(&layers, [1, channels, image_size, image_size], slots)
        }
        Commands::ExportConfig {
            config,
            num_ways,
            output,
        } => {
            let layers = builtin_config(&config, num_ways)?.ok_or_else(|| {
                fsl::meta::Error::config(format!(
                    "unknown builtin config `{}` (expected one of {})",
                    config,
                    BUILTIN_CONFIGS.join(", ")
                ))
            })?;
            export_config(&layers, output.as_deref())
        }
        Commands::MetaStep {
            args,
            deploy,
            steps,
            tasks,
            shots,
            queries,
            seed,
            save,
        } => {
            let mut model_args = match &args {
                Some(path) => read_args(path)?,
                None => ModelArgs {
                    deploy: "maml".into(),
                    ..ModelArgs::default()
                },
            };
            if let Some(deploy) = deploy {
                model_args.deploy = deploy;
            }
            meta_step(
                model_args,
                MetaStepOptions {
                    steps,
                    tasks,
                    shots,
                    queries,
                    seed,
                    save,
                },
            )
        }
    }
}

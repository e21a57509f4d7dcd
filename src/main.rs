//! Zarr Recipes CLI
//!
//! Subset and rechunk remote OPeNDAP datasets into Zarr stores.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use zarr_recipes::io::{self, DatasetOpener};
use zarr_recipes::transform::{determine_target_chunks, SchemaAccumulator};
use zarr_recipes::{build_runtime, init_rayon, run_recipe, Config, DapReader};

#[derive(Parser)]
#[command(name = "zarr-recipes")]
#[command(about = "Subset and rechunk remote OPeNDAP datasets into Zarr stores", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "recipe.yaml", global = true)]
    config: PathBuf,

    /// Override concurrency level
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the recipe (default if no command specified)
    Run,

    /// List the recipe's inputs without writing anything
    Analyze {
        /// Also fetch every input's metadata and print the combined layout
        #[arg(long)]
        schema: bool,
    },

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "recipe.yaml")]
        output: PathBuf,
    },

    /// Print the arrays of a Zarr store
    Inspect {
        /// Local path or s3:// URI of the store (defaults to the configured output)
        store: Option<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => run_command(cli.config, cli.concurrency)?,
        Some(Commands::Analyze { schema }) => analyze_command(cli.config, schema)?,
        Some(Commands::Validate) => validate_command(cli.config)?,
        Some(Commands::GenerateConfig { output }) => generate_config_command(output)?,
        Some(Commands::Inspect { store }) => inspect_command(cli.config, store)?,
    }

    Ok(())
}

fn load_config(config_path: &PathBuf, concurrency: Option<usize>) -> Result<Config> {
    let mut config = Config::from_file(config_path)?;
    if let Some(c) = concurrency {
        config.processing.concurrency = c;
    }
    config.validate()?;
    Ok(config)
}

fn run_command(config_path: PathBuf, concurrency: Option<usize>) -> Result<()> {
    let config = load_config(&config_path, concurrency)?;

    init_rayon(config.processing.rayon_threads)?;

    let runtime = build_runtime(config.processing.worker_threads)?;
    let stats = runtime.block_on(run_recipe(config))?;
    println!("{}", stats);

    Ok(())
}

fn analyze_command(config_path: PathBuf, fetch_schema: bool) -> Result<()> {
    let config = load_config(&config_path, None)?;
    let pattern = config.input.file_pattern();

    println!("\n=== Inputs ===");
    for (index, url) in pattern.items() {
        println!("{}  {}", index, url);
    }
    println!("\nDimensions: {:?}", pattern.dims());
    println!("Inputs: {}", pattern.len());
    if !config.input.subset.is_empty() {
        println!("Subset: {:?}", config.input.subset);
    }
    println!("Preprocess: {:?}", config.preprocess.chain());
    println!("Output: {}", config.output.path_display());
    println!("Target chunks: {:?}", config.output.target_chunks);

    if !fetch_schema {
        return Ok(());
    }

    let runtime = build_runtime(config.processing.worker_threads)?;
    runtime.block_on(async {
        let reader = DapReader::new(&config.processing, None)?;
        let chain = config.preprocess.chain();

        let mut acc = SchemaAccumulator::new();
        for (index, url) in pattern.items() {
            let schema = reader.open_schema(&url, &config.input.subset).await?;
            acc.add_input(&index, chain.apply_schema(schema)?)?;
        }
        let combined = acc.finish(&pattern)?;
        let chunks = determine_target_chunks(&combined.schema, &config.output.target_chunks)?;

        println!("\n=== Combined Layout ===");
        println!("Dimensions: {:?}", combined.schema.dims);
        for (name, var) in &combined.schema.variables {
            println!(
                "{}{} {} {:?} shape={:?} chunks={:?}",
                name,
                if var.is_coord { " (coord)" } else { "" },
                var.data_type,
                var.dims,
                var.shape,
                chunks.get(name).cloned().unwrap_or_default()
            );
        }
        Ok(())
    })
}

fn validate_command(config_path: PathBuf) -> Result<()> {
    load_config(&config_path, None)?;
    println!("Configuration is valid");
    Ok(())
}

fn inspect_command(config_path: PathBuf, store: Option<String>) -> Result<()> {
    let (object_store, path, display) = match store {
        Some(uri) => {
            let (object_store, path) = io::open_store_uri(&uri)?;
            (object_store, path, uri)
        }
        None => {
            let config = load_config(&config_path, None)?;
            (
                io::create_output_store(&config.output)?,
                io::output_target(&config.output),
                config.output.path_display(),
            )
        }
    };

    let runtime = build_runtime(None)?;
    let arrays = runtime
        .block_on(io::inspect_store(object_store, &path))
        .with_context(|| format!("Failed to inspect {}", display))?;

    println!("\n=== {} ===", display);
    if arrays.is_empty() {
        println!("(no arrays)");
    }
    for array in arrays {
        println!("{}", array);
    }
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    let yaml = r#"# Zarr Recipes Configuration

# === INPUT: Which remote datasets to read ===
input:
  # OPeNDAP URL with one {placeholder} per combine dimension
  url_template: "https://psl.noaa.gov/thredds/dodsC/Datasets/NARR/pressure/air.{time}.nc"

  # Dimension the inputs are concatenated along, one key per input
  concat_dim:
    name: time
    keys: ["197901", "197902"]
    # Items per input along the dimension, if known up front
    # nitems_per_file: 248

  # Dimensions whose inputs hold different variables (optional)
  merge_dims: []

  # Server-side subset per dimension: start, stop (exclusive), step
  subset: {}
  #   level: { start: 0, stop: 1 }

  # Keep only the first N keys per dimension (for test runs)
  # prune: 1

# === PREPROCESS: Applied to every input before writing ===
preprocess:
  # Data variables to reclassify as coordinates
  promote_to_coords: ["Lambert_Conformal"]

# === OUTPUT: Where to write the Zarr store ===
# Choose ONE of: local_path (local disk) OR bucket+prefix (S3)
output:
  # Option 1: Write to local filesystem
  local_path: "./output"

  # Option 2: Write to S3 (comment out local_path and uncomment these)
  # bucket: "output-bucket"
  # prefix: "recipes/narr"

  store_name: "narr-air.zarr"

  # Chunk size per dimension; unlisted dimensions are stored whole
  target_chunks:
    time: 1

  # Zstd compression level (0-22, higher = smaller but slower)
  compression_level: 3

# === PROCESSING: Performance tuning ===
processing:
  # Inputs opened concurrently
  concurrency: 4

  # Tokio async worker threads (null = num CPUs)
  # worker_threads: 8

  # Rayon thread pool size for XDR decoding (null = num CPUs)
  # rayon_threads: 8

  # Log progress metrics during processing
  enable_metrics: true
  metrics_interval_secs: 10
  # metrics_output_path: "metrics.json"

  # Timeout for a single HTTP request
  request_timeout_secs: 300

  # Parsed DDS/DAS responses kept in memory
  metadata_cache_entries: 1024

  # Retries for failed fetches (attempts include the first)
  retry:
    max_retries: 3
    initial_backoff_ms: 500
    max_backoff_ms: 30000
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        let cli = Cli::try_parse_from(["zarr-recipes"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("recipe.yaml"));
    }

    #[test]
    fn test_cli_parse_global_overrides() {
        let cli = Cli::try_parse_from(["zarr-recipes", "run", "-c", "other.yaml", "--concurrency", "8"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Run)));
        assert_eq!(cli.concurrency, Some(8));
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
    }

    #[test]
    fn test_cli_parse_analyze_and_inspect() {
        let cli = Cli::try_parse_from(["zarr-recipes", "analyze", "--schema"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Analyze { schema: true })));

        let cli = Cli::try_parse_from(["zarr-recipes", "inspect", "s3://bucket/narr.zarr"]).unwrap();
        match cli.command {
            Some(Commands::Inspect { store }) => assert_eq!(store.as_deref(), Some("s3://bucket/narr.zarr")),
            _ => panic!("expected inspect"),
        }
    }

    #[test]
    fn test_generated_config_is_valid() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("recipe.yaml");
        generate_config_command(path.clone()).unwrap();

        let config = Config::from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.input.concat_dim.keys, vec!["197901", "197902"]);
        assert_eq!(config.output.target_chunks["time"], 1);
    }
}

//! CLI subcommand handlers.

use crate::{Commands, ConfigAction};
use anyhow::Context;
use std::path::{Path, PathBuf};
use trainforge_core::config::{Config, Overrides, load_config};
use trainforge_core::data::{DataLoader, JsonDataset};
use trainforge_core::persistence;
use trainforge_core::{
    Evaluator, LearningRateFinder, Pipeliner, Predictor, RunContext, ThresholdFinder, Trainer,
};

/// Handle a CLI subcommand.
pub fn handle_command(
    command: Commands,
    config_path: Option<&Path>,
    output: Option<PathBuf>,
    quiet: bool,
) -> anyhow::Result<()> {
    if let Commands::Config { action } = command {
        return handle_config(action, config_path, output, quiet);
    }

    let config = resolve_config(config_path, output, quiet)?;
    let ctx = RunContext::new(config.clone());
    let checkpoint = |explicit: Option<PathBuf>| explicit.or_else(|| config.checkpoint_path.clone());

    match command {
        Commands::Train {
            train,
            val,
            checkpoint: resume,
        } => {
            let train = JsonDataset::load(&train, config.batch_size, Some(config.seed))
                .context("Failed to load training data")?;
            let val = val
                .map(|path| JsonDataset::load(&path, config.batch_size, None))
                .transpose()
                .context("Failed to load validation data")?;
            let mut trainer = Trainer::new(ctx, checkpoint(resume))?;
            let summary = trainer.run(&train, val.as_ref().map(|v| v as &dyn DataLoader))?;
            for path in summary.saved_checkpoints() {
                println!("Saved {}", path.display());
            }
            if summary.best_metric.is_finite() {
                println!("Best {}: {:.4}", config.target_metric, summary.best_metric);
            }
            Ok(())
        }
        Commands::Eval {
            data,
            checkpoint: path,
        } => {
            let data = load_data(&data, &config)?;
            let metrics = Evaluator::new(ctx, checkpoint(path))?.run(&data)?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
            Ok(())
        }
        Commands::Predict {
            data,
            checkpoint: path,
            out,
        } => {
            let data = load_data(&data, &config)?;
            let mut predictor = Predictor::new(ctx, checkpoint(path))?;
            let mut records = Vec::with_capacity(data.samples());
            for batch in data.batches() {
                let prediction = predictor.run(batch)?;
                for (row, id) in prediction.batch.ids.iter().enumerate() {
                    let mut record = serde_json::Map::new();
                    record.insert("id".into(), id.clone().into());
                    for (name, tensor) in &prediction.outputs {
                        record.insert(name.clone(), tensor.row(row).to_vec().into());
                    }
                    records.push(serde_json::Value::Object(record));
                }
            }
            match out {
                Some(path) => {
                    persistence::atomic_write_json(&path, &records)?;
                    println!("Wrote {} predictions to {}", records.len(), path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&records)?),
            }
            Ok(())
        }
        Commands::FindThreshold {
            data,
            checkpoint: path,
        } => {
            let data = load_data(&data, &config)?;
            let thresholds = ThresholdFinder::new(ctx, checkpoint(path))?.run(&data)?;
            println!("{}", serde_json::to_string(&thresholds)?);
            Ok(())
        }
        Commands::FindLr {
            data,
            checkpoint: path,
        } => {
            let data = JsonDataset::load(&data, config.batch_size, Some(config.seed))
                .context("Failed to load training data")?;
            let report = LearningRateFinder::new(ctx, checkpoint(path))?.run(&data)?;
            match report.suggested_lr {
                Some(lr) => println!("Suggested learning rate: {lr:.3e}"),
                None => println!("Not enough points to suggest a learning rate"),
            }
            println!("History: {}", report.history_path.display());
            println!("Plot: {}", report.plot_path.display());
            Ok(())
        }
        Commands::Sweep { data } => {
            let data = load_data(&data, &config)?;
            let pipeliner = Pipeliner::new(ctx, None)?;
            for result in pipeliner.evaluate_all(&data)? {
                let target = result
                    .metrics
                    .get(&config.target_metric)
                    .cloned()
                    .unwrap_or_default();
                println!("{}\t{} = {:?}", result.path.display(), config.target_metric, target);
            }
            Ok(())
        }
        Commands::SelectBest { data } => {
            let data = load_data(&data, &config)?;
            let mut pipeliner = Pipeliner::new(ctx, None)?;
            let best = pipeliner.find_best_checkpoint(&data)?;
            println!("{}", best.display());
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    }
}

fn handle_config(
    action: ConfigAction,
    config_path: Option<&Path>,
    output: Option<PathBuf>,
    quiet: bool,
) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init { path } => {
            if path.exists() {
                println!("Configuration file already exists at: {}", path.display());
                return Ok(());
            }
            let toml_str = toml::to_string_pretty(&Config::default())?;
            std::fs::write(&path, &toml_str)?;
            println!("Created default configuration at: {}", path.display());
            Ok(())
        }
        ConfigAction::Show => {
            let config = resolve_config(config_path, output, quiet)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Explicit file, else `~/.config/trainforge/config.toml` when present, then
/// environment variables and command-line overrides.
fn resolve_config(
    path: Option<&Path>,
    output: Option<PathBuf>,
    quiet: bool,
) -> anyhow::Result<Config> {
    let user_config = directories::ProjectDirs::from("dev", "trainforge", "trainforge")
        .map(|d| d.config_dir().join("config.toml"))
        .filter(|p| p.exists());
    let path = path.map(Path::to_path_buf).or(user_config);

    let mut overrides = Overrides::new();
    if let Some(output) = output {
        overrides.insert("output_path".into(), output.display().to_string().into());
    }
    if quiet {
        overrides.insert("show_progress".into(), false.into());
    }
    load_config(path.as_deref(), Some(&overrides))
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))
}

/// The run's output directory when the configuration resolves, otherwise the
/// user data directory.
pub fn log_dir(config_path: Option<&Path>, output: Option<&Path>) -> PathBuf {
    if let Some(output) = output {
        return output.to_path_buf();
    }
    resolve_config(config_path, None, false)
        .map(|config| config.output_path)
        .unwrap_or_else(|_| {
            directories::ProjectDirs::from("dev", "trainforge", "trainforge")
                .map(|d| d.data_dir().join("logs"))
                .unwrap_or_else(|| PathBuf::from("."))
        })
}

fn load_data(path: &Path, config: &Config) -> anyhow::Result<JsonDataset> {
    JsonDataset::load(path, config.batch_size, None)
        .with_context(|| format!("Failed to load {}", path.display()))
}

//! `genepipe init`.

use anyhow::{Context, Result};
use std::path::Path;

use genepipe::config::Config;

pub fn cmd_init(config_path: &Path, force: bool) -> Result<()> {
    let existed = config_path.exists();
    if existed && !force {
        println!(
            "Config already exists at {} (use --force to overwrite)",
            config_path.display()
        );
    } else {
        Config::default().save(config_path)?;
        println!("Wrote default config to {}", config_path.display());
    }

    let config = Config::load(config_path)?;
    std::fs::create_dir_all(&config.paths.runs_dir).with_context(|| {
        format!(
            "Failed to create runs directory {}",
            config.paths.runs_dir.display()
        )
    })?;

    println!();
    println!("Runs directory: {}", config.paths.runs_dir.display());
    println!("Run database:   {}", config.paths.db_path.display());
    println!();
    println!("Next steps:");
    println!("  1. Run `genepipe doctor` to check that the tools resolve");
    println!("  2. Run `genepipe submit --input reads.fastq --tools filter,assemble`");
    Ok(())
}

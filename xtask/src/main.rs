use anyhow::Result;
use clap::{Parser, Subcommand};
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build,
    /// Run all workspace tests
    Test,
    /// Run the CLI against a generated image
    Demo {
        /// Size of the generated image in bytes
        #[arg(long, default_value_t = 64 * 1024)]
        size: usize,
        /// Extra arguments passed to the CLI
        #[arg(last = true)]
        extra: Vec<String>,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build => {
            println!("Building project...");
            cargo(&["build", "--workspace"], "Build")?;
        }
        Commands::Test => {
            println!("Testing project...");
            cargo(&["test", "--workspace"], "Test")?;
        }
        Commands::Demo { size, extra } => {
            let path = std::env::temp_dir().join("btota-demo.bin");
            let image: Vec<u8> = (0..*size).map(|i| (i * 31 + 7) as u8).collect();
            std::fs::write(&path, image)?;
            println!("Running CLI on {} ({} bytes)...", path.display(), size);

            let path = path.to_string_lossy().into_owned();
            let mut args = vec!["run", "-p", "btota-cli", "--", "--image", path.as_str()];
            args.extend(extra.iter().map(String::as_str));
            cargo(&args, "Demo")?;
        }
    }

    Ok(())
}

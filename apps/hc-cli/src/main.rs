mod model_file;

use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use hc_config::ConfigDocumentBuilder;
use hc_engine::{BackendFactory, EngineError, EngineSettings, LocalEngineBinding, WorkerHost};
use hc_run::{
    RunContext, RunProgressEvent, RunResult, RunServices, RunSettings, RunStage,
    TracingSink,
};
use tracing_subscriber::EnvFilter;

use crate::model_file::{BasicValidator, DirectoryExporter, FileModel, ModelFile};

#[derive(Parser)]
#[command(name = "hc-cli")]
#[command(about = "HydroCouple CLI - drive a coupled engine run", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a model to its stop time
    Run {
        /// Path to the model YAML file
        model_path: PathBuf,
        /// Run settings YAML (engine library, worker, log levels)
        #[arg(short, long)]
        settings: Option<PathBuf>,
        /// Run the engine in a worker process
        #[arg(long)]
        remote: bool,
    },
    /// Write the engine config document for a model
    WriteConfig {
        /// Path to the model YAML file
        model_path: PathBuf,
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Host an engine library for a remote binding
    Worker {
        /// Native engine library to load
        #[arg(long)]
        library: PathBuf,
        /// Address the binding listens on
        #[arg(long)]
        connect: SocketAddr,
    },
}

fn main() -> RunResult<()> {
    let cli = Cli::parse();
    init_tracing(matches!(cli.command, Commands::Worker { .. }));

    match cli.command {
        Commands::Run {
            model_path,
            settings,
            remote,
        } => cmd_run(&model_path, settings.as_deref(), remote),
        Commands::WriteConfig { model_path, output } => {
            cmd_write_config(&model_path, output.as_deref())
        }
        Commands::Worker { library, connect } => cmd_worker(library, connect),
    }
}

/// The worker's stdout belongs to the engine library, so its logs go to stderr.
fn init_tracing(worker: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if worker {
        builder.with_writer(io::stderr).init();
    } else {
        builder.init();
    }
}

fn cmd_run(model_path: &Path, settings_path: Option<&Path>, remote: bool) -> RunResult<()> {
    let settings = match settings_path {
        Some(path) => RunSettings::load_yaml(path)?,
        None => RunSettings::default(),
    };
    let file = ModelFile::load(model_path)?;
    println!("Running model: {}", file.name);

    let exporter = DirectoryExporter::new(&file.source_dir);
    let backends = BackendFactory::new(settings.engine.clone());
    let mut model = FileModel::new(file);

    let services = RunServices {
        validator: &BasicValidator,
        exporter: &exporter,
        backends: &backends,
        sink: &TracingSink,
    };
    let prefer_remote = remote || settings.prefer_remote;

    let result = {
        let mut run = RunContext::new(&mut model, services, prefer_remote);
        let mut last_emit = Instant::now();
        run.on_progress(move |event| {
            if event.stage != RunStage::Stepping || last_emit.elapsed().as_millis() >= 100 {
                render_cli_progress(event);
                last_emit = Instant::now();
            }
        });
        let result = run.run_to_completion();
        clear_progress_line();

        let stats = run.statistics();
        println!("  Status: {}", run.status());
        println!("  Update calls: {}", stats.update_calls);
        println!("  Engine messages: {}", stats.messages_forwarded);
        println!(
            "  Wall time: {:.2}s (initialize {:.2}s, execute {:.2}s)",
            stats.total_time().as_secs_f64(),
            stats.initialize_time.as_secs_f64(),
            stats.execute_time.as_secs_f64()
        );
        result
    };

    if let Some(dir) = &model.connected_output {
        println!("  Output: {}", dir.display());
    }
    if let Some(log) = &model.run_log {
        println!("  Run log: {} bytes", log.len());
    }
    result?;
    println!("✓ Run completed");
    Ok(())
}

fn cmd_write_config(model_path: &Path, output: Option<&Path>) -> RunResult<()> {
    let file = ModelFile::load(model_path)?;
    let builder = ConfigDocumentBuilder::new();
    let document = builder.build(&file.component_spec());

    match output {
        Some(path) => {
            let model = FileModel::new(file);
            let output_dir = hc_run::CoupledModel::output_directory(&model);
            builder.save(path, &document, &output_dir)?;
            println!("✓ Wrote {}", path.display());
        }
        None => {
            let xml = hc_config::to_xml_string(&document)?;
            println!("{xml}");
        }
    }
    Ok(())
}

fn cmd_worker(library: PathBuf, connect: SocketAddr) -> RunResult<()> {
    let settings = EngineSettings {
        library_path: library,
        ..EngineSettings::default()
    };
    let mut host = WorkerHost::new(LocalEngineBinding::new(&settings));
    host.serve_connection(connect).map_err(EngineError::from)?;
    Ok(())
}

fn clear_progress_line() {
    print!("\r{}\r", " ".repeat(100));
    let _ = io::stdout().flush();
}

fn render_cli_progress(event: &RunProgressEvent) {
    match event.stage {
        RunStage::Stepping => {
            let width = 28usize;
            let filled = ((event.fraction_complete * width as f64).round() as usize).min(width);
            let bar = format!(
                "{}{}",
                "#".repeat(filled),
                "-".repeat(width.saturating_sub(filled))
            );
            let time = event
                .current_time
                .map(|t| t.to_string())
                .unwrap_or_default();
            print!(
                "\r[{}] {:>6.2}%  t={}  elapsed={:.1}s",
                bar,
                event.fraction_complete * 100.0,
                time,
                event.elapsed_wall_s
            );
            let _ = io::stdout().flush();
        }
        _ => {
            clear_progress_line();
            match &event.message {
                Some(message) => println!("  {:?}: {}", event.stage, message),
                None => println!("  {:?} ({})", event.stage, event.status),
            }
        }
    }
}

//! virtinfra CLI

use std::path::PathBuf;
use std::process::ExitCode;
use clap::{Parser, Subcommand};
use virtinfra::orchestrator::render_all;
use virtinfra::reconcile::KindStatus;
use virtinfra::{DesiredState, DriftPolicy, Orchestrator, Registry, Renderer, RunConfig, RunReport};

#[derive(Parser)]
#[command(name = "virtinfra")]
#[command(about = "Declarative virtual network provisioning for QEMU/KVM", long_about = None)]
#[command(version)]
struct Cli {
    /// Hypervisor identifier (qemu or kvm)
    #[arg(long, global = true, env = "VIRTINFRA_HYPERVISOR", default_value = "qemu")]
    hypervisor: String,
    /// Directory holding the definition templates
    #[arg(long, global = true, default_value = "templates")]
    templates: PathBuf,
    /// Desired-state YAML document
    #[arg(long, global = true, default_value = "values.yml")]
    values: PathBuf,
    /// Where rendered definitions are written
    #[arg(long, global = true, default_value = "generated")]
    output: PathBuf,
    /// Redefine existing resources whose definition changed
    #[arg(long, global = true)]
    correct_drift: bool,
    /// Print the run report as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, start and autostart every declared resource
    Create,
    /// Stop and undefine every declared resource
    Destroy,
    /// Show the state of every declared resource
    Status,
    /// Render definitions without touching the hypervisor
    Render,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("virtinfra=info".parse().expect("static directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> virtinfra::Result<()> {
    let config = RunConfig::builder()
        .hypervisor(cli.hypervisor)
        .template_dir(cli.templates)
        .output_dir(cli.output)
        .values_path(cli.values)
        .drift(if cli.correct_drift {
            DriftPolicy::Redefine
        } else {
            DriftPolicy::Ignore
        })
        .build_validated()?;

    // Fail on a missing or invalid document before connecting
    let desired = DesiredState::load(&config.values_path)?;
    let json = cli.json;

    match cli.command {
        Commands::Create => {
            let report = with_orchestrator(config, |orch| orch.create_infra(&desired))?;
            print_report(&report, json)?;
        }
        Commands::Destroy => {
            let report = with_orchestrator(config, |orch| orch.destroy_infra(&desired))?;
            print_report(&report, json)?;
        }
        Commands::Status => {
            let status = with_orchestrator(config, |orch| orch.status(&desired))?;
            print_status(&status, json)?;
        }
        Commands::Render => {
            let renderer = Renderer::new(&config.template_dir, config.output_dir.clone());
            let paths = render_all(&renderer, &Registry::with_defaults(), &desired)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&paths)?);
            } else {
                for path in paths {
                    println!("Generated {}", path.display());
                }
            }
        }
    }
    Ok(())
}

fn with_orchestrator<T>(
    config: RunConfig,
    f: impl FnOnce(&Orchestrator) -> virtinfra::Result<T>,
) -> virtinfra::Result<T> {
    let connector = virtinfra::session::default_connector();
    Orchestrator::scoped(config, connector.as_ref(), f)
}

fn print_report(report: &RunReport, json: bool) -> virtinfra::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    for kind in &report.kinds {
        println!("{}:", kind.kind);
        for resource in &kind.resources {
            if resource.is_noop() {
                println!("  {:<24} up to date", resource.name);
            } else {
                let actions: Vec<_> = resource
                    .actions
                    .iter()
                    .map(|a| format!("{:?}", a).to_lowercase())
                    .collect();
                println!("  {:<24} {}", resource.name, actions.join(", "));
            }
        }
    }
    for kind in &report.skipped {
        println!("{}: skipped (not supported yet)", kind);
    }
    Ok(())
}

fn print_status(status: &[KindStatus], json: bool) -> virtinfra::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(status)?);
        return Ok(());
    }

    for kind in status {
        println!("{}:", kind.kind);
        for resource in &kind.resources {
            println!("  {:<24} {}", resource.name, resource.state);
        }
    }
    Ok(())
}

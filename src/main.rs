//! virt-disk-convert CLI - Convert the disk images of a libvirt domain

use clap::{ArgAction, Parser};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::process::ExitCode;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use virt_disk_convert::{
    parse_target_format, ConversionTask, ConvertOptions, ProgressSink, QemuImgTool, Result,
    RunSummary, TaskStatus, TransactionCoordinator, VirshBackend,
};

#[derive(Parser)]
#[command(name = "virt-disk-convert")]
#[command(about = "Convert the disk images of a libvirt domain", long_about = None)]
#[command(version)]
struct Cli {
    /// Hypervisor connection URI
    #[arg(short = 'u', long, default_value = "qemu:///system")]
    connection_uri: String,

    /// Target image format (raw, qcow2, qcow, cow, qed, vdi, vmdk)
    #[arg(short = 'f', long, default_value = "qcow2")]
    output_format: String,

    /// Name of the domain whose disks should be converted
    #[arg(short = 'n', long)]
    dom_name: String,

    /// Append the image format to converted file names
    #[arg(short = 'x', long)]
    add_type_extension: bool,

    /// Show a progress bar while converting
    #[arg(short = 'p', long)]
    show_progress: bool,

    /// Remove the original images once the new configuration is defined
    #[arg(short = 'r', long)]
    remove_old_files: bool,

    /// Keep owner and group of the original images
    #[arg(short = 'o', long)]
    keep_file_ownership: bool,

    /// Keep permission bits of the original images
    #[arg(short = 'k', long)]
    keep_file_permissions: bool,

    /// Print the task list and exit without converting
    #[arg(long)]
    dry_run: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn info(msg: &str) {
    println!("{} {}", "[INFO]".blue(), msg);
}

fn success(msg: &str) {
    println!("{} {}", "[OK]".green(), msg);
}

fn warn(msg: &str) {
    println!("{} {}", "[WARN]".yellow(), msg);
}

fn error(msg: &str) {
    eprintln!("{} {}", "[ERROR]".red(), msg);
}

/// Progress bar per disk, driven by qemu-img's progress output
#[derive(Default)]
struct BarProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl ProgressSink for BarProgress {
    fn start(&self, disk: &str) {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::default_bar()
            .template("{msg:>6} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}%")
            .map(|style| style.progress_chars("#>-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(disk.to_string());
        if let Ok(mut current) = self.bar.lock() {
            *current = Some(bar);
        }
    }

    fn update(&self, _disk: &str, percent: f32) {
        if let Ok(current) = self.bar.lock() {
            if let Some(bar) = current.as_ref() {
                bar.set_position(percent as u64);
            }
        }
    }

    fn finish(&self, _disk: &str) {
        if let Ok(mut current) = self.bar.lock() {
            if let Some(bar) = current.take() {
                bar.finish();
            }
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_tasks(domain: &str, tasks: &[ConversionTask]) {
    if tasks.is_empty() {
        info(&format!("Domain '{}' has no file-backed disks", domain));
        return;
    }

    info(&format!("Disks of domain '{}':", domain));
    for (idx, task) in tasks.iter().enumerate() {
        match &task.status {
            TaskStatus::Skipped(reason) => println!("{:2}: {} ({})", idx, task, reason),
            _ => println!("{:2}: {}", idx, task),
        }
    }
}

fn report(summary: &RunSummary) {
    for warning in &summary.warnings {
        warn(&warning.to_string());
    }

    if summary.committed {
        success(&format!(
            "Converted {} disk(s) of domain '{}' to {}",
            summary.converted(),
            summary.domain,
            summary.target_format
        ));
    } else {
        success(&format!(
            "Nothing to convert for domain '{}', configuration left unchanged",
            summary.domain
        ));
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let target = parse_target_format(&cli.output_format)?;
    let options = ConvertOptions {
        add_type_extension: cli.add_type_extension,
        show_progress: cli.show_progress,
        remove_old_files: cli.remove_old_files,
        keep_ownership: cli.keep_file_ownership,
        keep_permissions: cli.keep_file_permissions,
        connection_uri: cli.connection_uri.clone(),
    };

    if options.keep_ownership && !nix::unistd::geteuid().is_root() {
        warn("Keeping file ownership usually requires running as root");
    }

    let manager = VirshBackend::new(options.connection_uri.clone());
    let tool = QemuImgTool::new()?;
    let progress = BarProgress::default();
    let coordinator = TransactionCoordinator::new(&manager, &tool).with_progress(&progress);

    let (_, tasks) = coordinator.plan(&cli.dom_name, target, &options)?;
    if cli.dry_run {
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        } else {
            print_tasks(&cli.dom_name, &tasks);
        }
        return Ok(());
    }
    if !cli.json {
        print_tasks(&cli.dom_name, &tasks);
    }

    let summary = coordinator.run(&cli.dom_name, target, &options)?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        report(&summary);
    }

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error(&e.to_string());
            ExitCode::FAILURE
        }
    }
}

//! Perceptual Distill CLI
//!
//! Runs the distillation training loop on a worker thread while the main
//! thread acts as the control surface: it drains the status queue on a timer
//! and turns stdin commands into shared-control writes (stop, batch size,
//! epoch target, steps per epoch).

use std::io::BufRead;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use perceptual_distill::model::net::{FastPerceptualNet, NetConfig};
use perceptual_distill::model::teacher::ProjectionTeacher;
use perceptual_distill::training::{ModelStatsObserver, ProgressObserver, Trainer, TrainerConfig};
use perceptual_distill::utils::logging::{init_logging, LogConfig};
use perceptual_distill::{status_channel, SharedControl};

/// Train a small convolutional network to mimic the intermediate features of
/// a large frozen reference network.
#[derive(Parser, Debug)]
#[command(name = "perceptual-distill")]
#[command(version = "0.1.0")]
#[command(about = "Adaptive training loop for perceptual-loss distillation", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the training loop
    Train {
        /// Directory with training images (flat, .jpg/.jpeg/.png)
        #[arg(short, long)]
        data_dir: String,

        /// Directory for checkpoints; training resumes from the newest one
        #[arg(short, long, default_value = "checkpoints")]
        checkpoint_dir: String,

        /// Total epoch target (can be raised at runtime via `epochs N`)
        #[arg(short, long, default_value_t = perceptual_distill::DEFAULT_EPOCHS)]
        epochs: usize,

        /// Optimizer steps per epoch
        #[arg(long, default_value_t = perceptual_distill::DEFAULT_STEPS_PER_EPOCH)]
        steps_per_epoch: usize,

        /// Batch size (can be changed at runtime via `batch N`)
        #[arg(short, long, default_value_t = perceptual_distill::DEFAULT_BATCH_SIZE)]
        batch_size: usize,

        /// Initial learning rate
        #[arg(short, long, default_value_t = 0.001)]
        learning_rate: f64,

        /// Edge length of square training patches
        #[arg(short, long, default_value_t = perceptual_distill::DEFAULT_PATCH_SIZE as u32)]
        patch_size: u32,

        /// Random seed for reproducibility
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    init_logging(&log_config).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Train {
            data_dir,
            checkpoint_dir,
            epochs,
            steps_per_epoch,
            batch_size,
            learning_rate,
            patch_size,
            seed,
        } => run_train(
            data_dir,
            checkpoint_dir,
            epochs,
            steps_per_epoch,
            batch_size,
            learning_rate,
            patch_size,
            seed,
        ),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_train(
    data_dir: String,
    checkpoint_dir: String,
    epochs: usize,
    steps_per_epoch: usize,
    batch_size: usize,
    learning_rate: f64,
    patch_size: u32,
    seed: u64,
) -> Result<()> {
    if batch_size == 0 || epochs == 0 || steps_per_epoch == 0 {
        anyhow::bail!("batch size, epochs and steps per epoch must all be positive");
    }

    let control = SharedControl::new(batch_size, epochs, steps_per_epoch);
    let (status_tx, status_rx) = status_channel();

    let mut config = TrainerConfig::new(data_dir, checkpoint_dir);
    config.patch_size = patch_size;
    config.seed = seed;
    config.scheduler.initial_lr = learning_rate;

    let teacher = Arc::new(ProjectionTeacher::standard(seed));
    let net_config = NetConfig {
        patch_size: patch_size as usize,
        hidden_channels: 32,
        feature_channels: perceptual_distill::FEATURE_CHANNELS,
    };
    let mut model = FastPerceptualNet::new(net_config, learning_rate, seed)?;

    let mut trainer = Trainer::new(config, teacher, control.clone(), status_tx.clone());
    trainer.add_observer(Box::new(ProgressObserver::new(status_tx.clone())));
    trainer.add_observer(Box::new(ModelStatsObserver::new(status_tx)));

    // Stdin commands become shared-control writes; the worker sees them at
    // the next epoch boundary.
    let stdin_control = control.clone();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines().map_while(|l| l.ok()) {
            handle_command(&stdin_control, line.trim());
        }
    });

    info!("Commands: stop | batch <n> | epochs <n> | steps <n>");

    let worker = thread::spawn(move || trainer.run(&mut model));

    // Drain status lines until the worker is done and its senders hung up.
    loop {
        if let Some(line) = status_rx.recv_timeout(Duration::from_millis(250)) {
            println!("{}", line);
            continue;
        }
        if worker.is_finished() {
            break;
        }
    }
    for line in status_rx.drain() {
        println!("{}", line);
    }

    let report = worker
        .join()
        .map_err(|_| anyhow::anyhow!("training worker panicked"))??;

    println!(
        "Run complete: {} epochs (started at {}), best loss {:.6}{}",
        report.epochs_completed,
        report.start_epoch,
        report.best_loss,
        if report.stopped_by_user {
            ", stopped by user"
        } else {
            ""
        }
    );
    if let Some(path) = &report.final_model_path {
        println!("Final model: {:?}", path);
    }

    Ok(())
}

/// Parse one control command. Unknown input is reported, never fatal.
fn handle_command(control: &SharedControl, line: &str) {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("stop"), None) => {
            control.request_stop();
            println!("Stop requested; finishing the current epoch...");
        }
        (Some("batch"), Some(n)) => match n.parse::<usize>() {
            Ok(v) if v > 0 => control.set_batch_size(v),
            _ => println!("batch expects a positive integer"),
        },
        (Some("epochs"), Some(n)) => match n.parse::<usize>() {
            Ok(v) if v > 0 => control.set_target_epochs(v),
            _ => println!("epochs expects a positive integer"),
        },
        (Some("steps"), Some(n)) => match n.parse::<usize>() {
            Ok(v) if v > 0 => control.set_steps_per_epoch(v),
            _ => println!("steps expects a positive integer"),
        },
        (Some(""), None) | (None, _) => {}
        _ => println!("Unknown command: {}", line),
    }
}

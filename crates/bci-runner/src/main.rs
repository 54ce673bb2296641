//! BCI Runner - replays a simulated motor-imagery recording through the pipeline
//!
//! Usage: `bci-runner [config.json]`, or `bci-runner --print-config` to dump
//! the built-in SMR-ERD preset as a starting point.

mod config;

use anyhow::{bail, Context, Result};
use bci_core::{ChannelSet, Chunk};
use bci_processing::{build_pipeline, smr_erd_pipelines, ProcessingNode, SessionState, SessionWorker, TapBus};
use bci_simulation::{ChunkedReplay, ErdConfig, ErdSimulator};
use config::{Processing, RunConfig, Simulation};
use std::path::Path;
use std::thread::JoinHandle;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const QUEUE_CAPACITY: usize = 1024;

/// Generate the whole recording, injecting ERD events at their onsets
fn simulate(simulation: &Simulation, channels: &[String], sampling_rate: f64) -> Vec<Vec<f64>> {
    let mut simulator = ErdSimulator::new(ErdConfig {
        channels: channels.to_vec(),
        sampling_rate,
        f_smr: simulation.f_smr,
        amplitude_smr: simulation.amplitude_smr,
        amplitude_noise: simulation.amplitude_noise,
        erd_length: simulation.erd_length,
        erd_shape: simulation.erd_shape,
        seed: simulation.seed,
    });

    let total = (simulation.duration * sampling_rate) as usize;
    let mut events = simulation.events.clone();
    events.sort_by(|a, b| a.at.total_cmp(&b.at));

    let mut rows = vec![Vec::with_capacity(total); channels.len()];
    let mut generated = 0;
    for event in events {
        let onset = ((event.at * sampling_rate) as usize).min(total);
        for (row, part) in rows.iter_mut().zip(simulator.generate(onset.saturating_sub(generated))) {
            row.extend(part);
        }
        generated = generated.max(onset);
        if !simulator.trigger(&event.channel) {
            warn!(channel = %event.channel, "ERD event on unknown channel ignored");
        }
    }
    for (row, part) in rows.iter_mut().zip(simulator.generate(total - generated)) {
        row.extend(part);
    }
    rows
}

/// Log every output of a session until it closes
fn log_outputs(label: &'static str, mut receiver: broadcast::Receiver<Chunk>) -> JoinHandle<usize> {
    std::thread::spawn(move || {
        let mut count = 0;
        loop {
            match receiver.blocking_recv() {
                Ok(chunk) => {
                    count += 1;
                    let values: Vec<String> = chunk.data.iter().map(|v| format!("{:.4}", v)).collect();
                    let timestamp = chunk.timestamps.as_ref().and_then(|ts| ts.last());
                    info!(branch = label, ?timestamp, values = %values.join(", "), "Features");
                }
                Err(RecvError::Lagged(skipped)) => warn!(branch = label, skipped, "Feature logger fell behind"),
                Err(RecvError::Closed) => return count,
            }
        }
    })
}

fn finish(worker: SessionWorker, logger: JoinHandle<usize>) -> Result<()> {
    let name = worker.name().to_string();
    let state = worker.stop();
    let outputs = logger.join().map_err(|_| anyhow::anyhow!("logger thread panicked"))?;
    match state {
        SessionState::Stopped { reason: Some(reason) } => bail!("session '{}' failed: {}", name, reason),
        _ => {
            info!(session = %name, outputs, "Session finished");
            Ok(())
        }
    }
}

fn run(config: RunConfig) -> Result<()> {
    let sampling_rate = config.processing.sampling_rate();
    let channels = config.processing.input_channels().to_vec();
    let rows = simulate(&config.simulation, &channels, sampling_rate);
    let replay = ChunkedReplay::new(rows, sampling_rate, 0.0)?.with_chunk_sizes(
        config.simulation.min_chunk,
        config.simulation.max_chunk,
        config.simulation.seed,
    )?;
    let bus = TapBus::default();

    match config.processing {
        Processing::SmrErd(preset) => {
            let pipelines = smr_erd_pipelines(&preset, &bus)?;
            info!(fs_out = pipelines.fs_out, branches = %pipelines.branch_channels(), "Running SMR-ERD preset");
            let mut common = pipelines.common;
            let eeg = SessionWorker::spawn("eeg", pipelines.eeg, QUEUE_CAPACITY)?;
            let eog = SessionWorker::spawn("eog", pipelines.eog, QUEUE_CAPACITY)?;
            let eeg_log = log_outputs("eeg", eeg.subscribe());
            let eog_log = log_outputs("eog", eog.subscribe());

            for chunk in replay {
                if let Some(pre) = common.process(&chunk).context("common preprocessing")? {
                    eeg.blocking_send(pre.clone())?;
                    eog.blocking_send(pre)?;
                }
            }
            finish(eeg, eeg_log)?;
            finish(eog, eog_log)
        }
        Processing::Pipeline { channels, pipeline, .. } => {
            let pipeline = build_pipeline(ChannelSet::new(channels)?, &pipeline, &bus)?;
            info!(pipeline = pipeline.name(), stages = pipeline.stage_count(), "Running pipeline");
            let worker = SessionWorker::spawn("pipeline", pipeline, QUEUE_CAPACITY)?;
            let logger = log_outputs("pipeline", worker.subscribe());
            for chunk in replay {
                worker.blocking_send(chunk)?;
            }
            finish(worker, logger)
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1).as_deref() {
        Some("--print-config") => {
            println!("{}", RunConfig::preset()?.to_json()?);
            return Ok(());
        }
        Some(path) => RunConfig::load(Path::new(path))?,
        None => RunConfig::preset()?,
    };
    info!(
        channels = config.processing.input_channels().len(),
        sampling_rate = config.processing.sampling_rate(),
        duration = config.simulation.duration,
        "Starting BCI runner"
    );
    run(config)
}

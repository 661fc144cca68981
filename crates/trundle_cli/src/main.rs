//! Headless driving loop for the Trundle simulation: fixed 60 Hz frames for
//! a requested duration, a rolling window of frame costs for a step-rate
//! report, and an optional CSV trace of the sampled trajectory.

use std::collections::VecDeque;
use std::time::Instant;

use anyhow::{Context, Result};
use log::info;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};
use trundle_core::{InitialState, Simulation, SphereParams};

const FRAME_DT: f64 = 1.0 / 60.0;
const FRAME_WINDOW: usize = 30;
const TRACE_PERIOD: f64 = 0.5;

fn main() -> Result<()> {
    TermLogger::init(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    // usage: trundle [seconds] [trace.csv]
    let mut args = std::env::args().skip(1);
    let seconds: f64 = match args.next() {
        Some(raw) => raw
            .parse()
            .context("duration must be a number of seconds")?,
        None => 10.0,
    };
    let trace_path = args.next();

    let mut sim = Simulation::new(SphereParams::default(), InitialState::default())?;
    info!(
        "model wired: {} graph nodes, running {seconds} s at 60 Hz",
        sim.graph().len()
    );

    let mut trace = match &trace_path {
        Some(path) => {
            let mut writer = csv::Writer::from_path(path)
                .with_context(|| format!("cannot create trace file {path}"))?;
            writer.write_record(["t", "x", "y", "z", "heading"])?;
            Some(writer)
        }
        None => None,
    };

    let frames = (seconds / FRAME_DT).ceil().max(0.0) as usize;
    let mut frame_costs: VecDeque<f64> = VecDeque::with_capacity(FRAME_WINDOW);
    let mut time = 0.0;

    for _ in 0..frames {
        let started = Instant::now();
        sim.tick(FRAME_DT);
        if frame_costs.len() == FRAME_WINDOW {
            frame_costs.pop_front();
        }
        frame_costs.push_back(started.elapsed().as_secs_f64());

        let next_time = time + FRAME_DT;
        if (next_time / TRACE_PERIOD).floor() != (time / TRACE_PERIOD).floor() {
            if let Some(writer) = trace.as_mut() {
                let pos = sim.center_position();
                writer.write_record([
                    format!("{next_time:.4}"),
                    format!("{:.6}", pos.x),
                    format!("{:.6}", pos.y),
                    format!("{:.6}", pos.z),
                    format!("{:.6}", sim.heading()),
                ])?;
            }
        }
        time = next_time;
    }

    if let Some(mut writer) = trace {
        writer.flush()?;
        if let Some(path) = &trace_path {
            info!("trace written to {path}");
        }
    }

    let spent: f64 = frame_costs.iter().sum();
    if spent > 0.0 {
        info!(
            "average frame cost {:.3} ms ({:.0} frames/s sustained)",
            1e3 * spent / frame_costs.len() as f64,
            frame_costs.len() as f64 / spent
        );
    }

    let pos = sim.position();
    let (axis, angle) = sim.orientation();
    info!(
        "after {time:.2} s: position ({:.3}, {:.3}, {:.3}), heading {:.3} rad",
        pos.x,
        pos.y,
        pos.z,
        sim.heading()
    );
    info!(
        "ball rotation: {angle:.3} rad about ({:.3}, {:.3}, {:.3})",
        axis.x, axis.y, axis.z
    );
    info!(
        "graph stats: {} nodes, {} recomputes",
        sim.graph().len(),
        sim.graph().recompute_count()
    );

    Ok(())
}

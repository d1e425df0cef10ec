//! Runs the offload handshake against an in-process co-processor.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kernels::{builtin_images, MATMUL_IMAGE, TRACKABILITY_IMAGE};
use offload::{
    MatMulJob, SessionConfig, StepOutcome, TeardownReport, TrackabilityJob, TransferSession,
    Workload,
};
use runtime_native::NativePlatform;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use transport::ProcessorId;
use transport_codecs::trackability::{Geometry, Partition};

/// Offload synthetic workloads to a native co-processor and verify them.
#[derive(Parser, Debug)]
#[command(author, version, about = "Exercise the GPP/DSP offload handshake", long_about = None)]
struct Cli {
    #[command(flatten)]
    link: LinkArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct LinkArgs {
    /// Shared buffer size in bytes (rounded up to 128).
    #[arg(long, default_value = offload::protocol::DEFAULT_BUFFER_SIZE, global = true)]
    buffer_size: String,
    /// Co-processor index.
    #[arg(long, default_value_t = 0, global = true)]
    dsp: u8,
    /// Number of arm/wait/consume cycles to run.
    #[arg(long, default_value_t = 1, global = true)]
    cycles: u32,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Minimum-eigenvalue map of a synthetic gradient image.
    Trackability {
        #[arg(long, default_value_t = 100)]
        rows: usize,
        #[arg(long, default_value_t = 64)]
        cols: usize,
        /// Window half-size in both directions.
        #[arg(long, default_value_t = 3)]
        window: usize,
        /// Border excluded on every side.
        #[arg(long, default_value_t = 4)]
        border: usize,
        /// Rows given to the co-processor; defaults to every interior row.
        #[arg(long)]
        dsp_rows: Option<usize>,
        #[arg(long, value_enum, default_value_t = Pattern::Constant)]
        pattern: Pattern,
        /// Gradient-x magnitude.
        #[arg(long, default_value_t = 2.0)]
        gx: f32,
        /// Gradient-y magnitude.
        #[arg(long, default_value_t = 0.0)]
        gy: f32,
        /// Largest accepted deviation from the floating-point reference.
        #[arg(long, default_value_t = 1.0)]
        tolerance: f64,
    },
    /// Square integer matrix product.
    Matmul {
        /// Matrix dimension.
        #[arg(short, long, default_value_t = 4)]
        n: usize,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Pattern {
    /// Every pixel carries the given gradients.
    Constant,
    /// Gradient-x flips sign on a checkerboard.
    Checker,
}

fn main() -> Result<()> {
    init_tracing();
    let Cli { link, command } = Cli::parse();

    let mut platform = NativePlatform::new();
    for (name, entry) in builtin_images() {
        platform = platform.with_image(name, entry);
    }

    match command {
        Command::Trackability {
            rows,
            cols,
            window,
            border,
            dsp_rows,
            pattern,
            gx,
            gy,
            tolerance,
        } => {
            let geometry = Geometry {
                rows,
                cols,
                window_hh: window,
                window_hw: window,
                border_x: border,
                border_y: border,
            };
            let partition = match dsp_rows {
                Some(band) => Partition::leading(&geometry, band),
                None => Partition::whole(&geometry),
            };
            run_trackability(&platform, &link, geometry, partition, pattern, (gx, gy), tolerance)
        }
        Command::Matmul { n } => run_matmul(&platform, &link, n),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(env_filter).try_init();
}

fn open_session(
    platform: &NativePlatform,
    link: &LinkArgs,
    image: &str,
    extra: Option<(transport_codecs::control::ControlTag, u32)>,
) -> Result<TransferSession> {
    let mut config = SessionConfig::new(image)
        .buffer_size(link.buffer_size.clone())
        .processor(ProcessorId::dsp(link.dsp));
    if let Some((tag, value)) = extra {
        config = config.setup_field(tag, value);
    }
    let host = platform.host_link().context("failed to open the host link")?;
    TransferSession::create(host, config)
        .with_context(|| format!("failed to start co-processor image {image:?}"))
}

/// Runs `job` for the requested number of cycles and tears the session down.
fn run_cycles<W: Workload>(
    mut session: TransferSession,
    cycles: u32,
    job: &W,
) -> Result<Vec<W::Output>> {
    let mut outputs = Vec::with_capacity(cycles as usize);
    let mut failure = None;
    for cycle in 0..cycles {
        match session.execute(job) {
            Ok(output) => outputs.push(output),
            Err(err) => {
                failure = Some(anyhow::Error::new(err).context(format!("cycle {cycle} failed")));
                break;
            }
        }
    }
    let report = session.teardown();
    print_report(&report);
    if let Some(err) = failure {
        return Err(err);
    }
    if let Some((step, reason)) = report.first_failure() {
        bail!("teardown failed at {step}: {reason}");
    }
    Ok(outputs)
}

fn run_trackability(
    platform: &NativePlatform,
    link: &LinkArgs,
    geometry: Geometry,
    partition: Partition,
    pattern: Pattern,
    (gx, gy): (f32, f32),
    tolerance: f64,
) -> Result<()> {
    let pixels = geometry.rows * geometry.cols;
    let grad_x: Vec<f32> = (0..pixels)
        .map(|i| match pattern {
            Pattern::Constant => gx,
            Pattern::Checker if (i / geometry.cols + i % geometry.cols) % 2 == 0 => gx,
            Pattern::Checker => -gx,
        })
        .collect();
    let grad_y = vec![gy; pixels];

    let job = TrackabilityJob::new(geometry, partition, &grad_x, &grad_y)
        .context("invalid trackability geometry")?;
    info!(
        rows = partition.rows,
        first_row = partition.first_row,
        bytes = job.required_bytes(),
        "trackability payload"
    );

    let session = open_session(platform, link, TRACKABILITY_IMAGE, None)?;
    let maps = run_cycles(session, link.cycles, &job)?;
    let reference = kernels::trackability::reference(&geometry, &partition, &grad_x, &grad_y);

    for (cycle, map) in maps.iter().enumerate() {
        let deviation = map
            .values
            .iter()
            .zip(&reference)
            .map(|(&got, want)| (f64::from(got) - want).abs())
            .fold(0.0f64, f64::max);
        println!(
            "cycle {cycle}: {} results, max deviation {deviation:.4} from reference",
            map.values.len()
        );
        if deviation > tolerance {
            bail!("cycle {cycle} deviates by {deviation} (tolerance {tolerance})");
        }
    }
    println!("trackability verified");
    Ok(())
}

fn run_matmul(platform: &NativePlatform, link: &LinkArgs, n: usize) -> Result<()> {
    let a: Vec<i32> = (0..n * n).map(|i| (i % 7) as i32 - 3).collect();
    let b: Vec<i32> = (0..n * n).map(|i| ((i * 3) % 5) as i32).collect();
    let expected = kernels::matmul::multiply(n, &a, &b);

    let job = MatMulJob::new(n, a, b).context("invalid matrix size")?;
    let session = open_session(platform, link, MATMUL_IMAGE, Some(job.setup_field()))?;
    let products = run_cycles(session, link.cycles, &job)?;

    for (cycle, product) in products.iter().enumerate() {
        if *product != expected {
            bail!("cycle {cycle}: product {product:?} differs from reference {expected:?}");
        }
        println!("cycle {cycle}: {n}x{n} product matches reference");
    }
    println!("matmul verified");
    Ok(())
}

fn print_report(report: &TeardownReport) {
    for (step, outcome) in report.steps() {
        let outcome = match outcome {
            StepOutcome::Done => "done".to_string(),
            StepOutcome::AlreadyReleased => "already released".to_string(),
            StepOutcome::Failed(reason) => format!("FAILED: {reason}"),
        };
        info!(%step, %outcome, "teardown");
    }
}

use anyhow::Context;
use clap::Parser;
use ndarray::Array4;
use rand::Rng;
use std::path::PathBuf;
use tiny_convnet::utils::head::predict_labels;
use tiny_convnet::utils::mat::gaussian;
use tiny_convnet::utils::misc::{ensure_finite, eval_numerical_gradient, rel_error_with_floor};
use tiny_convnet::{BatchNormConvNet, Classifier, ConvNetConfig, ParamSet, Precision, Scalar, ThreeLayerConvNet};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Builds a classifier on a random batch and checks its analytic gradients
/// against central differences.
#[derive(Parser, Debug)]
#[command(name = "tiny_convnet", version)]
struct Cli {
    /// JSON network configuration; defaults to the small gradient-check net
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the batch-normalized variant
    #[arg(long)]
    batchnorm: bool,

    #[arg(long, default_value_t = 2)]
    batch_size: usize,

    /// Overrides the seed from the configuration
    #[arg(long)]
    seed: Option<u64>,

    /// Finite-difference step
    #[arg(long, default_value_t = 1e-5)]
    step: f64,

    /// Relative error above which a parameter is reported as failing
    #[arg(long, default_value_t = 1e-5)]
    tolerance: f64,

    /// Lower bound on the relative-error denominator; raise it for nets whose
    /// true gradients are exactly zero (biases ahead of batch norm)
    #[arg(long, default_value_t = 1e-8)]
    floor: f64,

    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str::<ConvNetConfig>(&text)
                .with_context(|| format!("parsing config {}", path.display()))?
        }
        None => ConvNetConfig::tiny().with_reg(0.5).with_seed(231),
    };
    if let Some(seed) = cli.seed {
        config.seed = Some(seed);
    }
    config.validate()?;

    match config.precision {
        Precision::F32 => run::<f32>(&cli, &config),
        Precision::F64 => run::<f64>(&cli, &config),
    }
}

fn run<A: Scalar>(cli: &Cli, config: &ConvNetConfig) -> anyhow::Result<()> {
    let mut rng = config.rng();
    let (c, h, w) = config.input_dim;
    let x: Array4<A> = gaussian((cli.batch_size, c, h, w), 1.0, &mut rng);
    let labels: Vec<usize> = (0..cli.batch_size)
        .map(|_| rng.gen_range(0..config.num_classes))
        .collect();

    if cli.batchnorm {
        let mut net = BatchNormConvNet::<A>::with_rng(config, &mut rng)?;
        check(&mut net, &x, &labels, cli)
    } else {
        let mut net = ThreeLayerConvNet::<A>::with_rng(config, &mut rng)?;
        check(&mut net, &x, &labels, cli)
    }
}

fn check<A: Scalar, C: Classifier<A> + Clone>(net: &mut C, x: &Array4<A>, labels: &[usize], cli: &Cli) -> anyhow::Result<()> {
    let (loss, grads) = net.loss(x, labels)?;
    ensure_finite("loss", &ndarray::arr0(loss))?;
    info!(%loss, num_params = net.params().num_params(), "training loss");

    let scores = net.predict(x)?;
    ensure_finite("scores", &scores)?;
    info!(shape = ?scores.dim(), predicted = ?predict_labels(&scores), ?labels, "inference scores");

    let mut failing = 0;
    for name in grads.names() {
        let numerical = eval_numerical_gradient(net, x, labels, name, A::of(cli.step))?;
        let analytic = grads
            .get(name)
            .with_context(|| format!("missing gradient for {}", name))?;
        let err = rel_error_with_floor(numerical.view(), analytic, cli.floor)?;
        if err > cli.tolerance {
            failing += 1;
            warn!("{} max relative error: {:e}", name, err);
        } else {
            info!("{} max relative error: {:e}", name, err);
        }
    }
    if failing > 0 {
        anyhow::bail!("{} parameter(s) exceeded tolerance {:e}", failing, cli.tolerance);
    }
    Ok(())
}

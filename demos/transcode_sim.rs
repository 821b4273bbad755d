use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use video_hw_pipeline::{
    BitstreamSource, Codec, DEFAULT_CHUNK_SIZE, Dimensions, FaultPlan, FileSink, FileSource,
    FrameGeometry, FrameSink, InitParamsExt, MemorySource, NullSink, Pipeline, PipelineConfig,
    PixelFormat, SimBackend, SimConfig, StageKind, VideoParamsExt, frame_stream,
};

#[derive(Parser, Debug)]
#[command(about = "Run a simulated decode -> filter -> encode fan-out pipeline")]
struct Args {
    /// Length-prefixed frame stream; synthetic frames are generated when omitted.
    #[arg(long)]
    input: Option<PathBuf>,
    #[arg(long, default_value_t = 120)]
    synthetic_frames: u32,
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    chunk_bytes: usize,
    /// Directory for per-output streams; outputs are discarded when omitted.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 2)]
    outputs: u32,
    #[arg(long, default_value = "h264")]
    codec: String,
    #[arg(long, default_value_t = 30)]
    gop: u16,
    #[arg(long, default_value_t = false)]
    filter: bool,
    /// Extra output that writes decoded frames instead of encoding them.
    #[arg(long, default_value_t = false)]
    raw_output: bool,
    #[arg(long, default_value_t = 320)]
    width: u32,
    #[arg(long, default_value_t = 240)]
    height: u32,
    #[arg(long, default_value_t = 8)]
    pool_size: usize,
    #[arg(long, default_value_t = 4)]
    async_depth: usize,
    #[arg(long)]
    queue_capacity: Option<usize>,
    #[arg(long)]
    max_frames: Option<u64>,
    #[arg(long, default_value_t = 0)]
    decode_reorder: usize,
    #[arg(long, default_value_t = 0)]
    encode_delay: usize,
    /// Have encoders return every packet in two buffers.
    #[arg(long, default_value_t = false)]
    encode_splits: bool,
    #[arg(long, default_value_t = 0)]
    threads: u16,
    /// Inject a device hang into the encoder at this frame order.
    #[arg(long)]
    hang_at: Option<u64>,
    #[arg(long, default_value_t = false)]
    soft_recovery: bool,
    /// Make the decoder report busy this many times on its first frame.
    #[arg(long, default_value_t = 0)]
    busy_retries: u32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let codec = parse_codec(&args.codec)?;
    let dims = Dimensions::new(args.width, args.height)
        .with_context(|| format!("invalid frame size {}x{}", args.width, args.height))?;

    let mut faults = FaultPlan::default();
    if let Some(order) = args.hang_at {
        faults = faults.hang_on_submit(StageKind::Encode, order);
    }
    if args.busy_retries > 0 {
        faults = faults.busy(StageKind::Decode, 0, args.busy_retries);
    }
    let backend = Arc::new(SimBackend::new(SimConfig {
        decode_reorder: args.decode_reorder,
        encode_delay: args.encode_delay,
        encode_splits: args.encode_splits,
        faults,
        ..SimConfig::default()
    }));

    let config = PipelineConfig {
        pool_size: args.pool_size,
        geometry: FrameGeometry::new(dims, PixelFormat::Nv12),
        async_depth: args.async_depth,
        queue_capacity: args.queue_capacity,
        soft_hang_recovery: args.soft_recovery,
        max_frames: args.max_frames,
        upstream_timeout: Duration::from_secs(30),
        ..PipelineConfig::default()
    };

    let mut init = InitParamsExt::default();
    init.async_depth = u16::try_from(args.async_depth).unwrap_or(u16::MAX);
    init.num_threads = args.threads;
    let mut builder = Pipeline::builder(backend, config)
        .init_params(&init)
        .context("invalid session parameters")?
        .source(open_source(&args)?);
    if args.filter {
        builder = builder.with_filter();
    }

    let mut params = VideoParamsExt::default();
    params.codec = codec;
    params.gop_size = args.gop;
    params.async_depth = u16::try_from(args.async_depth).unwrap_or(u16::MAX);
    for target in 0..args.outputs {
        let sink = open_sink(args.output_dir.as_ref(), &format!("out_{target}.{}", args.codec))?;
        builder = builder
            .encode_output(target, &params, sink)
            .with_context(|| format!("failed to configure output {target}"))?;
    }
    if args.raw_output {
        let sink = open_sink(args.output_dir.as_ref(), "raw.nv12")?;
        builder = builder.raw_output(args.outputs, sink);
    }

    let pipeline = builder.build().context("failed to build pipeline")?;
    let report = pipeline.run().context("pipeline failed")?;
    println!("{report}");
    Ok(())
}

fn parse_codec(value: &str) -> Result<Codec> {
    match value.to_ascii_lowercase().as_str() {
        "h264" | "avc" => Ok(Codec::H264),
        "hevc" | "h265" => Ok(Codec::Hevc),
        "av1" => Ok(Codec::Av1),
        other => bail!("unsupported codec: {other}"),
    }
}

fn open_source(args: &Args) -> Result<Box<dyn BitstreamSource>> {
    if let Some(path) = &args.input {
        let source = FileSource::open(path, args.chunk_bytes)
            .with_context(|| format!("failed to open input: {}", path.display()))?;
        return Ok(Box::new(source));
    }
    let frames: Vec<Vec<u8>> = (0..args.synthetic_frames)
        .map(|index| index.to_le_bytes().repeat(16))
        .collect();
    Ok(Box::new(MemorySource::new(
        &frame_stream(&frames),
        args.chunk_bytes,
    )))
}

fn open_sink(dir: Option<&PathBuf>, name: &str) -> Result<Box<dyn FrameSink>> {
    let Some(dir) = dir else {
        return Ok(Box::new(NullSink));
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create output dir: {}", dir.display()))?;
    let path = dir.join(name);
    let sink = FileSink::create(&path)
        .with_context(|| format!("failed to create output: {}", path.display()))?;
    Ok(Box::new(sink))
}

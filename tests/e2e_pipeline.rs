use std::num::NonZeroU32;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rstest::rstest;
use video_hw_pipeline::{
    BusyPolicy, Codec, Dimensions, EncoderRoi, FaultPlan, FrameGeometry, FrameSink, MemorySink,
    MemorySource, ParamError, Pipeline, PipelineConfig, PipelineError, PixelFormat, SimBackend,
    SimConfig, SimPacket, StageKind, StageRole, VideoParamsExt, frame_stream,
};

fn payloads(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| format!("frame-{i:03}").into_bytes())
        .collect()
}

fn config() -> PipelineConfig {
    PipelineConfig {
        pool_size: 6,
        geometry: FrameGeometry::new(
            Dimensions::new(64, 36).expect("valid dims"),
            PixelFormat::Nv12,
        ),
        async_depth: 2,
        surface_wait: Duration::from_secs(5),
        upstream_timeout: Duration::from_secs(10),
        sync_timeout: Duration::from_secs(5),
        output_buffer_size: 256,
        ..PipelineConfig::default()
    }
}

fn params(codec: Codec) -> VideoParamsExt {
    let mut params = VideoParamsExt::default();
    params.codec = codec;
    params
}

fn packets(sink: &MemorySink) -> Vec<SimPacket> {
    SimPacket::parse_all(&sink.contents()).expect("sink should hold whole packets")
}

fn orders(packets: &[SimPacket]) -> Vec<u64> {
    packets.iter().map(|packet| packet.frame_order).collect()
}

#[rstest]
#[case(12, 5, 0, 0, 1, false)]
#[case(12, 64, 2, 0, 2, false)]
#[case(30, 7, 1, 2, 4, false)]
#[case(30, 4096, 3, 3, 3, false)]
#[case(12, 9, 0, 0, 1, true)]
#[case(20, 13, 1, 2, 2, true)]
fn e2e_transcode_preserves_every_frame_in_order(
    #[case] frame_count: usize,
    #[case] chunk_bytes: usize,
    #[case] decode_reorder: usize,
    #[case] encode_delay: usize,
    #[case] async_depth: usize,
    #[case] encode_splits: bool,
) {
    let backend = Arc::new(SimBackend::new(SimConfig {
        decode_reorder,
        encode_delay,
        encode_splits,
        ..SimConfig::default()
    }));
    let sink = MemorySink::new();
    let stream = frame_stream(payloads(frame_count));
    let pipeline = Pipeline::builder(
        backend.clone(),
        PipelineConfig {
            async_depth,
            ..config()
        },
    )
    .source(MemorySource::new(&stream, chunk_bytes))
    .encode_output(1, &params(Codec::H264), sink.clone())
    .expect("params should copy")
    .build()
    .expect("pipeline should build");
    let pool = pipeline.pool();

    let report = pipeline.run().expect("pipeline should finish");

    let packets = packets(&sink);
    assert_eq!(orders(&packets), (0..frame_count as u64).collect::<Vec<_>>());
    assert!(packets[0].keyframe);
    assert!(packets[1..].iter().all(|packet| !packet.keyframe));
    for (packet, payload) in packets.iter().zip(payloads(frame_count)) {
        assert_eq!(packet.payload, payload);
    }
    let encode = report.output(1).expect("encode report");
    assert_eq!(encode.frames, frame_count as u64);
    assert_eq!(encode.keyframes, 1);
    assert_eq!(pool.free_count(), pool.len());
    assert_eq!(backend.outstanding_ops(), 0);
}

#[test]
fn e2e_fan_out_feeds_every_branch() {
    let backend = Arc::new(SimBackend::new(SimConfig::default()));
    let h264 = MemorySink::new();
    let hevc = MemorySink::new();
    let raw = MemorySink::new();
    let stream = frame_stream(payloads(15));
    let report = Pipeline::builder(backend, config())
        .source(MemorySource::new(&stream, 11))
        .encode_output(1, &params(Codec::H264), h264.clone())
        .expect("params should copy")
        .encode_output(2, &params(Codec::Hevc), hevc.clone())
        .expect("params should copy")
        .raw_output(3, raw.clone())
        .build()
        .expect("pipeline should build")
        .run()
        .expect("pipeline should finish");

    let first = packets(&h264);
    let second = packets(&hevc);
    assert_eq!(orders(&first), (0..15).collect::<Vec<_>>());
    assert_eq!(orders(&second), (0..15).collect::<Vec<_>>());
    assert!(first.iter().all(|p| p.codec == Codec::H264 && p.target_id == 1));
    assert!(second.iter().all(|p| p.codec == Codec::Hevc && p.target_id == 2));
    assert_eq!(raw.contents(), payloads(15).concat());
    assert_eq!(report.output(3).expect("raw report").frames, 15);
}

#[test]
fn e2e_filter_rate_doubling_emits_two_frames_per_input() {
    let backend = Arc::new(SimBackend::new(SimConfig {
        filter_doubles_rate: true,
        ..SimConfig::default()
    }));
    let sink = MemorySink::new();
    let stream = frame_stream(payloads(8));
    let pipeline = Pipeline::builder(backend, config())
        .source(MemorySource::new(&stream, 32))
        .with_filter()
        .encode_output(1, &params(Codec::Av1), sink.clone())
        .expect("params should copy")
        .build()
        .expect("pipeline should build");
    let pool = pipeline.pool();
    let report = pipeline.run().expect("pipeline should finish");

    let packets = packets(&sink);
    assert_eq!(orders(&packets), (0..16).collect::<Vec<_>>());
    let inverted: Vec<u8> = payloads(8)[3].iter().map(|byte| !byte).collect();
    assert_eq!(packets[6].payload, inverted);
    assert_eq!(packets[7].payload, inverted);
    assert_eq!(report.stage(StageRole::Filter).expect("filter report").frames, 16);
    assert_eq!(pool.free_count(), pool.len());
}

#[test]
fn e2e_decode_then_filter_to_raw() {
    let backend = Arc::new(SimBackend::new(SimConfig::default()));
    let raw = MemorySink::new();
    let stream = frame_stream(payloads(4));
    Pipeline::builder(backend, config())
        .source(MemorySource::new(&stream, 3))
        .with_filter()
        .raw_output(1, raw.clone())
        .build()
        .expect("pipeline should build")
        .run()
        .expect("pipeline should finish");
    let expected: Vec<u8> = payloads(4).concat().iter().map(|byte| !byte).collect();
    assert_eq!(raw.contents(), expected);
}

#[rstest]
#[case(FaultPlan::default().hang_on_submit(StageKind::Encode, 10))]
#[case(FaultPlan::default().hang_on_submit(StageKind::Decode, 10))]
#[case(FaultPlan::default().hang_on_sync(StageKind::Decode, 10))]
fn e2e_soft_hang_recovery_forces_resync_on_next_frame(#[case] faults: FaultPlan) {
    let backend = Arc::new(SimBackend::new(SimConfig {
        faults,
        ..SimConfig::default()
    }));
    let sink = MemorySink::new();
    let stream = frame_stream(payloads(20));
    let report = Pipeline::builder(
        backend,
        PipelineConfig {
            soft_hang_recovery: true,
            async_depth: 1,
            ..config()
        },
    )
    .source(MemorySource::new(&stream, 16))
    .encode_output(1, &params(Codec::H264), sink.clone())
    .expect("params should copy")
    .build()
    .expect("pipeline should build")
    .run()
    .expect("soft recovery should keep the pipeline alive");

    let packets = packets(&sink);
    let expected: Vec<u64> = (0..20).filter(|order| *order != 10).collect();
    assert_eq!(orders(&packets), expected);
    let keyframes: Vec<u64> = packets
        .iter()
        .filter(|packet| packet.keyframe)
        .map(|packet| packet.frame_order)
        .collect();
    assert_eq!(keyframes, vec![0, 11]);
    assert_eq!(report.output(1).expect("encode report").keyframes, 2);
    assert_eq!(report.recovered_hangs(), 1);
}

#[test]
fn e2e_hang_without_recovery_fails_the_pipeline() {
    let backend = Arc::new(SimBackend::new(SimConfig {
        faults: FaultPlan::default().hang_on_submit(StageKind::Encode, 4),
        ..SimConfig::default()
    }));
    let stream = frame_stream(payloads(10));
    let pipeline = Pipeline::builder(backend, config())
        .source(MemorySource::new(&stream, 16))
        .encode_output(1, &params(Codec::H264), MemorySink::new())
        .expect("params should copy")
        .build()
        .expect("pipeline should build");
    let pool = pipeline.pool();

    let err = pipeline.run().expect_err("hang should be fatal");
    match err {
        PipelineError::StageFailed {
            stage,
            frame_index,
            source,
        } => {
            assert_eq!(stage, StageKind::Encode);
            assert_eq!(frame_index, 4);
            assert!(source.is_device_hang());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(pool.free_count(), pool.len());
}

#[test]
fn e2e_busy_device_is_retried() {
    let backend = Arc::new(SimBackend::new(SimConfig {
        faults: FaultPlan::default()
            .busy(StageKind::Decode, 2, 3)
            .busy(StageKind::Encode, 5, 4),
        ..SimConfig::default()
    }));
    let sink = MemorySink::new();
    let stream = frame_stream(payloads(8));
    let report = Pipeline::builder(backend, config())
        .source(MemorySource::new(&stream, 64))
        .encode_output(1, &params(Codec::H264), sink.clone())
        .expect("params should copy")
        .build()
        .expect("pipeline should build")
        .run()
        .expect("busy device should be retried");

    assert_eq!(packets(&sink).len(), 8);
    assert_eq!(report.stage(StageRole::Decode).expect("decode").busy.retries, 3);
    assert_eq!(report.output(1).expect("encode").busy.retries, 4);
}

#[test]
fn e2e_endless_busy_becomes_device_failure() {
    let backend = Arc::new(SimBackend::new(SimConfig {
        faults: FaultPlan::default().busy(StageKind::Decode, 2, u32::MAX),
        ..SimConfig::default()
    }));
    let stream = frame_stream(payloads(6));
    let err = Pipeline::builder(
        backend,
        PipelineConfig {
            busy_policy: BusyPolicy {
                backoff: Duration::from_millis(1),
                busy_timeout: Duration::from_millis(30),
            },
            ..config()
        },
    )
    .source(MemorySource::new(&stream, 64))
    .encode_output(1, &params(Codec::H264), MemorySink::new())
    .expect("params should copy")
    .build()
    .expect("pipeline should build")
    .run()
    .expect_err("busy past the timeout should fail");

    assert!(matches!(
        err,
        PipelineError::StageFailed {
            stage: StageKind::Decode,
            frame_index: 2,
            ..
        }
    ));
    assert!(err.to_string().contains("busy"));
}

#[test]
fn e2e_pool_larger_than_device_limit_is_rejected() {
    let backend = Arc::new(SimBackend::new(SimConfig {
        max_frames: 2,
        ..SimConfig::default()
    }));
    let result = Pipeline::builder(backend, config())
        .source(MemorySource::new(&[], 16))
        .raw_output(1, MemorySink::new())
        .build();
    assert!(matches!(
        result,
        Err(PipelineError::ResourceExhausted {
            requested: 6,
            available: 2
        })
    ));
}

#[test]
fn e2e_frame_limit_stops_early_and_drains() {
    let backend = Arc::new(SimBackend::new(SimConfig {
        decode_reorder: 2,
        ..SimConfig::default()
    }));
    let sink = MemorySink::new();
    let stream = frame_stream(payloads(20));
    let pipeline = Pipeline::builder(
        backend,
        PipelineConfig {
            max_frames: Some(5),
            ..config()
        },
    )
    .source(MemorySource::new(&stream, 64))
    .encode_output(1, &params(Codec::H264), sink.clone())
    .expect("params should copy")
    .build()
    .expect("pipeline should build");
    let pool = pipeline.pool();
    let report = pipeline.run().expect("pipeline should finish");

    assert_eq!(orders(&packets(&sink)), vec![0, 1, 2, 3, 4]);
    assert_eq!(report.stage(StageRole::Decode).expect("decode").frames, 5);
    assert_eq!(pool.free_count(), pool.len());
}

#[test]
fn e2e_reset_interval_forces_periodic_keyframes() {
    let backend = Arc::new(SimBackend::new(SimConfig::default()));
    let sink = MemorySink::new();
    let stream = frame_stream(payloads(13));
    let report = Pipeline::builder(
        backend,
        PipelineConfig {
            reset_interval: NonZeroU32::new(4),
            ..config()
        },
    )
    .source(MemorySource::new(&stream, 64))
    .encode_output(1, &params(Codec::H264), sink.clone())
    .expect("params should copy")
    .build()
    .expect("pipeline should build")
    .run()
    .expect("pipeline should finish");

    let keyframes: Vec<u64> = packets(&sink)
        .iter()
        .filter(|packet| packet.keyframe)
        .map(|packet| packet.frame_order)
        .collect();
    assert_eq!(keyframes, vec![0, 4, 8, 12]);
    let encode = report.output(1).expect("encode");
    assert_eq!(encode.forced_resyncs, 3);
    assert_eq!(encode.keyframes, 4);
}

#[test]
fn e2e_bounded_queues_still_complete() {
    let backend = Arc::new(SimBackend::new(SimConfig::default()));
    let sink = MemorySink::new();
    let stream = frame_stream(payloads(25));
    Pipeline::builder(
        backend,
        PipelineConfig {
            queue_capacity: Some(1),
            pool_size: 8,
            ..config()
        },
    )
    .source(MemorySource::new(&stream, 9))
    .with_filter()
    .encode_output(1, &params(Codec::H264), sink.clone())
    .expect("params should copy")
    .build()
    .expect("pipeline should build")
    .run()
    .expect("pipeline should finish");
    assert_eq!(packets(&sink).len(), 25);
}

#[test]
fn e2e_encode_params_outside_copy_allow_list_are_rejected() {
    let backend = Arc::new(SimBackend::new(SimConfig::default()));
    let mut template = params(Codec::H264);
    template
        .add_block::<EncoderRoi>()
        .expect("block should be added");
    let result = Pipeline::builder(backend, config()).encode_output(1, &template, MemorySink::new());
    assert!(matches!(
        result,
        Err(PipelineError::Param(ParamError::CopyNotAllowed { .. }))
    ));
}

/// Sink that sleeps on every write so a stop request lands mid-stream.
struct SlowSink {
    inner: MemorySink,
    delay: Duration,
}

impl FrameSink for SlowSink {
    fn write_output(&mut self, data: &[u8]) -> Result<(), PipelineError> {
        thread::sleep(self.delay);
        self.inner.write_output(data)
    }
}

#[test]
fn e2e_stop_request_ends_run_and_returns_frames() {
    let backend = Arc::new(SimBackend::new(SimConfig::default()));
    let sink = MemorySink::new();
    let stream = frame_stream(payloads(500));
    let pipeline = Pipeline::builder(
        backend,
        PipelineConfig {
            async_depth: 1,
            ..config()
        },
    )
    .source(MemorySource::new(&stream, 64))
    .encode_output(
        1,
        &params(Codec::H264),
        SlowSink {
            inner: sink.clone(),
            delay: Duration::from_millis(2),
        },
    )
    .expect("params should copy")
    .build()
    .expect("pipeline should build");
    let stop = pipeline.stop_handle();
    let pool = pipeline.pool();

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        stop.stop();
    });
    let report = pipeline.run().expect("stop is not a failure");
    stopper.join().expect("stopper thread");

    assert!(report.stopped);
    let written = packets(&sink).len();
    assert!(written < 500, "wrote {written} packets");
    assert_eq!(pool.free_count(), pool.len());
}

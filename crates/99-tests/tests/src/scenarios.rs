use kernels::trackability::reference;
use kernels::{MATMUL_IMAGE, TRACKABILITY_IMAGE};
use offload::{MatMulJob, OffloadError, SessionConfig, TrackabilityJob, Workload};
use transport::{PoolAddr, Side};
use transport_codecs::control::ControlTag;
use transport_codecs::fixed::RESOLUTION;
use transport_codecs::trackability::{Geometry, Partition};

use crate::support::{open, platform};

fn klt_geometry() -> Geometry {
    Geometry {
        rows: 100,
        cols: 64,
        window_hh: 3,
        window_hw: 3,
        border_x: 4,
        border_y: 4,
    }
}

#[test]
fn constant_gradient_matches_float_reference() {
    let geometry = klt_geometry();
    let partition = Partition::whole(&geometry);
    let gx = vec![2.0f32; 100 * 64];
    let gy = vec![0.0f32; 100 * 64];
    let job = TrackabilityJob::new(geometry, partition, &gx, &gy).expect("job");

    let platform = platform();
    let mut session = open(&platform, SessionConfig::new(TRACKABILITY_IMAGE));
    let map = session.execute(&job).expect("cycle");

    assert_eq!(map.partition, Partition { first_row: 4, rows: 92 });
    assert_eq!(map.first_col, 4);
    assert_eq!(map.cols, 56);
    assert_eq!(map.values.len(), 92 * 56);

    // [[4 * 49, 0], [0, 0]] has a zero minimum eigenvalue.
    let expected = reference(&geometry, &partition, &gx, &gy);
    for (got, want) in map.values.iter().zip(&expected) {
        assert!((f64::from(*got) - want).abs() <= RESOLUTION, "{got} vs {want}");
    }
    assert_eq!(map.at(50, 30), Some(0));
    assert_eq!(map.at(3, 30), None);

    assert!(session.teardown().is_clean());
}

#[test]
fn leading_band_only_covers_its_rows() {
    let geometry = klt_geometry();
    let partition = Partition::leading(&geometry, 46);
    let gx: Vec<f32> = (0..100 * 64)
        .map(|i| if (i / 64 + i % 64) % 2 == 0 { 2.0 } else { -2.0 })
        .collect();
    let gy = vec![2.0f32; 100 * 64];
    let job = TrackabilityJob::new(geometry, partition, &gx, &gy).expect("job");

    let platform = platform();
    let mut session = open(&platform, SessionConfig::new(TRACKABILITY_IMAGE));
    let map = session.execute(&job).expect("cycle");
    assert_eq!(map.values.len(), 46 * 56);
    assert_eq!(map.at(49, 10), Some(map.values[45 * 56 + 6]));
    assert_eq!(map.at(50, 10), None);

    let expected = reference(&geometry, &partition, &gx, &gy);
    let worst = map
        .values
        .iter()
        .zip(&expected)
        .map(|(&got, want)| (f64::from(got) - want).abs())
        .fold(0.0, f64::max);
    assert!(worst <= 1.0, "worst deviation {worst}");
    assert!(session.teardown().is_clean());
}

#[test]
fn matrix_product_is_exact() {
    #[rustfmt::skip]
    let a = vec![
        1, 2, 3, 4,
        5, 6, 7, 8,
        9, 10, 11, 12,
        13, 14, 15, 16,
    ];
    #[rustfmt::skip]
    let b = vec![
        1, 0, 2, 0,
        0, 1, 0, 2,
        -1, 0, 1, 0,
        0, -1, 0, 1,
    ];
    #[rustfmt::skip]
    let product = vec![
        -2, -2, 5, 8,
        -2, -2, 17, 20,
        -2, -2, 29, 32,
        -2, -2, 41, 44,
    ];
    let job = MatMulJob::new(4, a, b).expect("job");
    let (tag, value) = job.setup_field();

    let platform = platform();
    let mut session = open(&platform, SessionConfig::new(MATMUL_IMAGE).setup_field(tag, value));
    assert_eq!(session.execute(&job).expect("cycle"), product);
    assert!(session.teardown().is_clean());
}

#[test]
fn repeated_cycles_reuse_the_buffer() {
    let platform = platform();
    let first = MatMulJob::new(3, (1..=9).collect(), vec![1, 0, 0, 0, 1, 0, 0, 0, 1]).expect("job");
    let second = MatMulJob::new(3, vec![2; 9], vec![3; 9]).expect("job");
    let (tag, value) = first.setup_field();
    let mut session = open(&platform, SessionConfig::new(MATMUL_IMAGE).setup_field(tag, value));

    for _ in 0..3 {
        assert_eq!(session.execute(&first).expect("first"), (1..=9).collect::<Vec<_>>());
        assert_eq!(session.execute(&second).expect("second"), vec![18; 9]);
    }
    assert_eq!(session.cycles(), 6);
    assert!(session.teardown().is_clean());
}

#[test]
fn oversized_payload_leaves_the_buffer_untouched() {
    let platform = platform();
    let config = SessionConfig::new(MATMUL_IMAGE)
        .buffer_size("256")
        .setup_field(ControlTag::MatrixSize, 4);
    let pool_id = config.pool();
    let mut session = open(&platform, config);

    let pool = platform.pools().attach(pool_id).expect("pool");
    let buffer = pool
        .buffer_at(PoolAddr::Remote(session.remote_addr()), session.buffer_size())
        .expect("buffer");
    let snapshot = |pool: &transport::SharedBufferPool| -> Vec<u8> {
        pool.acquire(Side::Gpp, &buffer).expect("host owns the buffer").to_vec()
    };
    let before = snapshot(&pool);

    // 4x4 needs 3 * 16 words = 192 bytes; 10x10 needs 1200.
    let big = MatMulJob::new(10, vec![1; 100], vec![1; 100]).expect("job");
    assert!(big.required_bytes() > session.buffer_size());
    let err = session.execute(&big).expect_err("does not fit");
    assert!(matches!(
        err,
        OffloadError::CapacityExceeded {
            required: 1200,
            available: 256
        }
    ));
    assert_eq!(snapshot(&pool), before);
    assert_eq!(pool.owner(&buffer).expect("owner"), Side::Gpp);
    assert_eq!(session.cycles(), 0);

    let fits = MatMulJob::new(4, vec![1; 16], vec![1; 16]).expect("job");
    assert_eq!(session.execute(&fits).expect("cycle"), vec![4; 16]);

    drop(pool);
    assert!(session.teardown().is_clean());
}

#[test]
fn matrix_size_must_match_the_negotiated_one() {
    let platform = platform();
    let config = SessionConfig::new(MATMUL_IMAGE).setup_field(ControlTag::MatrixSize, 4);
    let mut session = open(&platform, config);

    let small = MatMulJob::new(2, vec![1, 2, 3, 4], vec![1, 0, 0, 1]).expect("job");
    let err = session.execute(&small).expect_err("size mismatch");
    assert!(matches!(
        err,
        OffloadError::SetupMismatch {
            tag: ControlTag::MatrixSize,
            required: 2,
            negotiated: Some(4)
        }
    ));
    assert_eq!(session.cycles(), 0);

    let identity: Vec<i32> = (0..16).map(|i| i32::from(i % 5 == 0)).collect();
    let a: Vec<i32> = (1..=16).collect();
    let fits = MatMulJob::new(4, a.clone(), identity).expect("job");
    assert_eq!(session.execute(&fits).expect("cycle"), a);
    assert!(session.teardown().is_clean());
}

#[test]
fn matrix_job_needs_a_negotiated_size() {
    let platform = platform();
    let mut session = open(&platform, SessionConfig::new(TRACKABILITY_IMAGE));
    let job = MatMulJob::new(2, vec![1; 4], vec![1; 4]).expect("job");
    assert!(matches!(
        session.execute(&job),
        Err(OffloadError::SetupMismatch {
            negotiated: None,
            ..
        })
    ));
    assert!(session.teardown().is_clean());
}

#[test]
fn non_default_control_ids_reach_the_peer() {
    let platform = platform();
    let config = SessionConfig::new(MATMUL_IMAGE)
        .pool_id(3)
        .event(1, 7)
        .setup_field(ControlTag::MatrixSize, 2);
    let pool_id = config.pool();
    let mut session = open(&platform, config);
    assert!(platform.pools().attach(pool_id).is_ok());

    let job = MatMulJob::new(2, vec![1, 2, 3, 4], vec![0, 1, 1, 0]).expect("job");
    assert_eq!(session.execute(&job).expect("cycle"), vec![2, 1, 4, 3]);
    assert!(session.teardown().is_clean());
}

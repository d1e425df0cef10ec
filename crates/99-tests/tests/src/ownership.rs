//! Ownership hand-off under scheduling noise: every cycle must observe the
//! payload packed for that cycle and nothing older.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use offload::protocol::STATUS_OK;
use offload::{run_image, Kernel, OffloadResult, SessionConfig, Workload};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use transport::{
    DspEnv, ImageEntry, PoolAddr, PoolAttrs, PoolId, PoolRegistry, ProcessorId, Rendezvous, Side,
};
use transport_codecs::words::{Words, WordsMut};

use crate::support::{open, platform_with};

const CHECKSUM_IMAGE: &str = "checksum";

/// Word 0 holds a count `n`, words `1..=n` the values; the kernel stores
/// their wrapping sum at word `n + 1`.
struct Checksum;

impl Kernel for Checksum {
    fn name(&self) -> &'static str {
        CHECKSUM_IMAGE
    }

    fn run(&mut self, buf: &mut [u8]) -> u32 {
        thread::sleep(Duration::from_micros(rand::thread_rng().gen_range(0..300)));
        let words = Words::new(buf);
        let Ok(n) = words.get(0) else { return 1 };
        let Ok(values) = words.range(1, n as usize) else {
            return 1;
        };
        let sum = values.iter().fold(0i32, |acc, v| acc.wrapping_add(*v));
        match WordsMut::new(buf).set(n as usize + 1, sum) {
            Ok(()) => STATUS_OK,
            Err(_) => 1,
        }
    }
}

fn checksum_image(env: DspEnv) -> i32 {
    run_image(env, Checksum)
}

struct Summed(Vec<i32>);

impl Workload for Summed {
    type Output = i32;

    fn required_bytes(&self) -> usize {
        (self.0.len() + 2) * 4
    }

    fn pack(&self, buf: &mut [u8]) -> OffloadResult<()> {
        let mut words = WordsMut::new(buf);
        words.set(0, self.0.len() as i32)?;
        words.put(1, &self.0)?;
        words.set(self.0.len() + 1, -1)?;
        Ok(())
    }

    fn unpack(&self, buf: &[u8]) -> OffloadResult<i32> {
        Ok(Words::new(buf).get(self.0.len() + 1)?)
    }
}

#[test]
fn every_cycle_sees_its_own_payload() {
    let platform = platform_with(&[(CHECKSUM_IMAGE, checksum_image as ImageEntry)]);
    let mut session = open(&platform, SessionConfig::new(CHECKSUM_IMAGE).buffer_size("4096"));
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for cycle in 0..200 {
        let len = rng.gen_range(1..=500);
        let values: Vec<i32> = (0..len).map(|_| rng.gen_range(-1000..1000)).collect();
        let expected: i32 = values.iter().sum();
        if rng.gen_bool(0.3) {
            thread::sleep(Duration::from_micros(rng.gen_range(0..200)));
        }
        let got = session.execute(&Summed(values)).expect("cycle");
        assert_eq!(got, expected, "cycle {cycle}");
    }
    assert_eq!(session.cycles(), 200);
    assert!(session.teardown().is_clean());
}

#[test]
fn host_cannot_touch_the_buffer_while_the_peer_owns_it() {
    let platform = platform_with(&[(CHECKSUM_IMAGE, checksum_image as ImageEntry)]);
    let config = SessionConfig::new(CHECKSUM_IMAGE).buffer_size("1024");
    let pool_id = config.pool();
    let mut session = open(&platform, config);

    let pool = platform.pools().attach(pool_id).expect("pool");
    let buffer = pool
        .buffer_at(PoolAddr::Remote(session.remote_addr()), session.buffer_size())
        .expect("buffer");

    // Hand the buffer over without arming a cycle.
    pool.acquire(Side::Gpp, &buffer)
        .expect("host owns it at rest")
        .release_to(Side::Dsp)
        .expect("release");
    assert!(pool.acquire(Side::Gpp, &buffer).is_err());
    assert_eq!(pool.owner(&buffer).expect("owner"), Side::Dsp);

    // The session's own arm step refuses too, and that poisons the session.
    assert!(session.execute(&Summed(vec![1, 2, 3])).is_err());
    assert!(session.execute(&Summed(vec![1])).is_err());

    pool.acquire(Side::Dsp, &buffer)
        .expect("peer side")
        .release_to(Side::Gpp)
        .expect("return");
    drop(pool);
    assert!(session.teardown().is_clean());
}

fn pause(rng: &mut StdRng) {
    if rng.gen_bool(0.5) {
        thread::sleep(Duration::from_micros(rng.gen_range(0..250)));
    }
}

/// Both halves of the hand-off on raw pool and rendezvous primitives, with
/// delays between writeback and the wakeup and between the wakeup and the
/// invalidating acquire.
#[test]
fn hand_off_survives_delays_around_cache_maintenance() {
    const CYCLES: i32 = 150;
    let registry = PoolRegistry::new();
    let id = PoolId::new(ProcessorId::dsp(0), 9);
    let pool = registry.open(id, &PoolAttrs::single(1024, 1)).expect("pool");
    let buffer = pool.allocate(Side::Gpp, 1024).expect("buffer");
    let to_dsp = Arc::new(Rendezvous::counting());
    let to_gpp = Arc::new(Rendezvous::counting());

    let peer = {
        let pool = Arc::clone(&pool);
        let to_dsp = Arc::clone(&to_dsp);
        let to_gpp = Arc::clone(&to_gpp);
        thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(0xd5b);
            for _ in 0..CYCLES {
                to_dsp.wait_forever();
                pause(&mut rng);
                let mut guard = pool.acquire(Side::Dsp, &buffer).expect("peer owns it");
                let value = Words::new(&guard).get(0).expect("word 0");
                WordsMut::new(&mut guard)
                    .set(1, value.wrapping_mul(3))
                    .expect("word 1");
                guard.release_to(Side::Gpp).expect("return");
                pause(&mut rng);
                to_gpp.post();
            }
        })
    };

    let mut rng = StdRng::seed_from_u64(0x9bb);
    for cycle in 0..CYCLES {
        let mut guard = pool.acquire(Side::Gpp, &buffer).expect("host owns it");
        let mut words = WordsMut::new(&mut guard);
        words.set(0, cycle).expect("word 0");
        words.set(1, -1).expect("word 1");
        guard.release_to(Side::Dsp).expect("hand over");
        pause(&mut rng);
        assert!(pool.acquire(Side::Gpp, &buffer).is_err(), "cycle {cycle}");
        to_dsp.post();

        to_gpp.wait_forever();
        pause(&mut rng);
        let guard = pool.acquire(Side::Gpp, &buffer).expect("returned");
        assert_eq!(Words::new(&guard).get(1).expect("word 1"), cycle * 3, "cycle {cycle}");
    }
    peer.join().expect("peer");

    pool.free(&buffer).expect("free");
    drop(pool);
    registry.close(id).expect("close");
}

#![no_main]

use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;
use rope_rep_fuzzing::Ops;

/// Upper bound on the node payload bytes a single test case keeps alive.
const PAYLOAD_LIMIT: usize = 4 << 20;

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn decode(data: &[u8]) -> Option<Ops> {
    bincode::decode_from_slice::<Ops, _>(data, bincode_config())
        .ok()
        .map(|(ops, _)| ops)
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // Leave roughly one in eight mutations to libFuzzer's byte-level
    // strategies.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let mut ops = decode(data).unwrap_or_default();
    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    if session.mutate(&mut ops).is_err() {
        return fuzzer_mutate(data, size, max_size);
    }

    // Trim trailing ops until the encoding fits in `data`.
    loop {
        match bincode::encode_into_slice(&ops, data, bincode_config()) {
            Ok(new_size) => return new_size,
            Err(_) if ops.pop() => {}
            Err(_) => return fuzzer_mutate(data, size, max_size),
        }
    }
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    if let Some(ops) = decode(data) {
        if let Err(e) = ops.run(PAYLOAD_LIMIT) {
            panic!("error: {e}");
        }
    }
});

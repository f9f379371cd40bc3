#![no_main]
use libfuzzer_sys::fuzz_target;
use swarm_dl::bencode;

fuzz_target!(|data: &[u8]| {
    // decoding must never panic on arbitrary input, and anything that
    // decodes must re-encode to the same bytes
    if let Ok(value) = bencode::decode(data) {
        assert_eq!(bencode::encode(&value), data);
    }
    let _ = bencode::decode_prefix(data);
});

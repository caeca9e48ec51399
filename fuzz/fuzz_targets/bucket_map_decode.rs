#![no_main]

use libfuzzer_sys::fuzz_target;
use quill_skill_cache::cache_store::{decode_bucket_map, encode_bucket_map};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    if let Ok(loaded) = decode_bucket_map("fuzz", &raw) {
        let encoded = encode_bucket_map(&loaded.buckets).expect("decoded map must encode");
        let reloaded = decode_bucket_map("fuzz", &encoded).expect("encoded map must decode");
        assert_eq!(reloaded.buckets, loaded.buckets);
        assert_eq!(reloaded.malformed_buckets, 0);
    }
});

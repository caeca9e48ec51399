#![no_main]

use libfuzzer_sys::fuzz_target;
use quill_agent_pool::{decode_agent_frame, AgentFrame};

fuzz_target!(|data: &[u8]| {
    let raw = String::from_utf8_lossy(data);
    for line in raw.lines() {
        if let Ok(AgentFrame::Init { session_id }) = decode_agent_frame(line) {
            assert!(!session_id.trim().is_empty());
        }
    }
});

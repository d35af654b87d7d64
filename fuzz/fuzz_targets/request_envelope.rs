#![no_main]

use std::sync::OnceLock;

use celljail_core::rpc::RequestEnvelope;
use celljail_core::{CallError, Jail, MethodRouter};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fn jail() -> &'static Jail {
    static JAIL: OnceLock<Jail> = OnceLock::new();
    JAIL.get_or_init(|| {
        Jail::with_policy(
            MethodRouter::new()
                .with_method("echo", |call, _| Ok(Value::Array(call.params.clone())))
                .with_method("fail", |_, _| Err(CallError::recoverable("fail")))
                .with_method("halt", |_, _| Err(CallError::fatal("halt"))),
        )
    })
}

fuzz_target!(|data: &[u8]| {
    let Ok(raw) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(envelope) = RequestEnvelope::parse(raw) {
        assert_eq!(envelope.is_batch(), raw.trim_start().starts_with('['));
        if !envelope.is_batch() {
            assert_eq!(envelope.calls().len(), 1);
        }
    }

    // Full path: decode, dispatch, serialization. Any outcome
    // is fine as long as a batch answers every call in order.
    let Ok(response) = jail().dispatch("fuzz", raw) else {
        return;
    };
    let parsed: Value = serde_json::from_str(&response).expect("response is JSON");
    if let (Ok(RequestEnvelope::Batch(calls)), Value::Array(entries)) =
        (RequestEnvelope::parse(raw), &parsed)
    {
        assert_eq!(calls.len(), entries.len());
    }
});

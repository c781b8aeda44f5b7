#![no_main]

use libfuzzer_sys::fuzz_target;
use netplay_client::protocol::Envelope;

fuzz_target!(|data: &[u8]| {
    let _ = serde_json::from_slice::<Envelope>(data);

    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(envelope) = serde_json::from_str::<Envelope>(text) else {
        return;
    };

    // Anything accepted must re-encode, and decode again to the same value.
    let encoded = serde_json::to_string(&envelope).expect("accepted envelope must encode");
    let again: Envelope = serde_json::from_str(&encoded).expect("encoded envelope must decode");
    assert_eq!(envelope.message.kind(), again.message.kind());
    assert_eq!(envelope.sequence, again.sequence);
});

//! Fuzz harness for the gpg output parsers.
//!
//! gpg's diagnostic output is untrusted text; every parser must return
//! `None`/`false` on garbage rather than panic.

#![no_main]
use libfuzzer_sys::fuzz_target;
use rhagent_core::identity::parse;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);

    let _ = parse::fingerprint(&text);
    let _ = parse::import_key_id(&text);
    let _ = parse::packet_key_id(&text);
    let _ = parse::signature_is_valid(&text);
});

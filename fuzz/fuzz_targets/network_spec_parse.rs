//! Fuzz harness for the `"<ip>/<prefix> <vlan>"` network argument and the
//! LXC config-file model.

#![no_main]
use libfuzzer_sys::fuzz_target;
use rhagent_core::engine::LxcConfig;
use rhagent_core::network::NetworkSpec;

fuzz_target!(|data: &[u8]| {
    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(spec) = NetworkSpec::parse(s) {
        // Gateway arithmetic wraps instead of overflowing.
        let _ = spec.address.synthetic_gateway();
        let _ = spec.address.contains(spec.address.synthetic_gateway());
    }

    let mut conf = LxcConfig::parse(s);
    let _ = conf.get("lxc.network.ipv4");
    conf.set("#vlan_id", "42");
    assert_eq!(conf.get("#vlan_id"), Some("42"));
    let _ = conf.render();
});

//! The neighbor responder answering on a real segment.
//!
//! veild runs in veil-a. veil-b gets on-link routes for the overlay subnets
//! and pings into them, so its kernel ARPs on veth-b; whatever lands in its
//! neighbor table tells us whether veil-a answered.

use crate::*;

fn with_overlay_routes<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    for net in ["10.0.1.0/24", "10.0.3.0/24"] {
        netns_exec(NS_B, &["ip", "route", "replace", net, "dev", VETH_B])?;
    }
    let result = f();
    for net in ["10.0.1.0/24", "10.0.3.0/24"] {
        let _ = netns_exec(NS_B, &["ip", "route", "del", net, "dev", VETH_B]);
    }
    let _ = netns_exec(NS_B, &["ip", "neigh", "flush", "dev", VETH_B]);
    result
}

/// Trigger resolution of `addr` from veil-b and return the lladdr it learned, if any.
fn resolve_from_b(addr: &str) -> Result<Option<veil_core::MacAddr>> {
    let _ = netns_exec(NS_B, &["ip", "neigh", "del", addr, "dev", VETH_B]);
    // The ping itself goes unanswered; only the ARP exchange matters.
    let _ = netns_exec(NS_B, &["ping", "-c", "1", "-W", "1", addr]);

    let out = netns_exec(NS_B, &["ip", "neigh", "show", addr, "dev", VETH_B])?;
    let mut words = out.split_whitespace();
    while let Some(word) = words.next() {
        if word == "lladdr" {
            let mac = words.next().context("lladdr without value")?;
            return Ok(Some(mac.parse()?));
        }
    }
    Ok(None)
}

#[test]
fn test_answers_for_remote_peer_only() {
    if !ready() {
        return;
    }
    let _lock = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let dir = NodeDir::new("arp").unwrap();
    dir.write_hosts(&three_hosts()).unwrap();
    let node = spawn_veild(NS_A, &dir, &[]).unwrap();

    let result = (|| -> Result<()> {
        wait_for_api(NS_A, 20)?;
        let mac_a = link_mac(NS_A, VETH_A)?;

        with_overlay_routes(|| {
            // C is remote: veil-a claims it.
            let remote = resolve_from_b("10.0.3.7")?;
            assert_eq!(remote, Some(mac_a), "expected veil-a to answer for 10.0.3.7");

            // A's own subnet: silence.
            let local = resolve_from_b("10.0.1.7")?;
            assert_eq!(local, None, "veil-a must not answer for its own overlay subnet");

            // Nobody owns 10.0.9.0/24.
            netns_exec(NS_B, &["ip", "route", "replace", "10.0.9.0/24", "dev", VETH_B])?;
            let unknown = resolve_from_b("10.0.9.1");
            let _ = netns_exec(NS_B, &["ip", "route", "del", "10.0.9.0/24", "dev", VETH_B]);
            assert_eq!(unknown?, None, "veil-a must not answer for unknown addresses");
            Ok(())
        })
    })();

    if result.is_err() {
        dump_log(&dir);
    }
    stop(node);
    result.unwrap();
}

#[test]
fn test_follows_host_file_reload() {
    if !ready() {
        return;
    }
    let _lock = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let dir = NodeDir::new("arp-reload").unwrap();
    dir.write_hosts(&serde_json::json!([
        { "id": "a", "endpoint": ENDPOINT_A, "self": true, "overlay_addresses": ["10.0.1.0/24"] },
        { "id": "b", "endpoint": ENDPOINT_B, "overlay_addresses": ["10.0.2.0/24"] }
    ]))
    .unwrap();
    let node = spawn_veild(NS_A, &dir, &[]).unwrap();

    let result = (|| -> Result<()> {
        wait_for_api(NS_A, 20)?;
        let mac_a = link_mac(NS_A, VETH_A)?;

        with_overlay_routes(|| {
            assert_eq!(resolve_from_b("10.0.3.7")?, None);

            dir.write_hosts(&three_hosts())?;
            let reload = api_post(NS_A, "/v1/reload")?;
            assert_eq!(reload["changed"], true, "reload response: {reload}");

            assert_eq!(resolve_from_b("10.0.3.7")?, Some(mac_a));
            Ok(())
        })
    })();

    if result.is_err() {
        dump_log(&dir);
    }
    stop(node);
    result.unwrap();
}

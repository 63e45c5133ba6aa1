use crate::*;

#[test]
fn test_namespaces_exist() {
    if !netns_available() {
        eprintln!("SKIP: netns not available, run sudo ./scripts/netns-up.sh first");
        return;
    }

    let out_a =
        netns_exec(NS_A, &["ip", "link", "show", VETH_A]).expect("veth-a should exist in veil-a");
    assert!(out_a.contains(VETH_A), "veth-a not found in veil-a");

    let out_b =
        netns_exec(NS_B, &["ip", "link", "show", VETH_B]).expect("veth-b should exist in veil-b");
    assert!(out_b.contains(VETH_B), "veth-b not found in veil-b");
}

#[test]
fn test_endpoints_assigned() {
    if !netns_available() {
        eprintln!("SKIP: netns not available");
        return;
    }

    let out_a = netns_exec(NS_A, &["ip", "-4", "addr", "show", VETH_A]).unwrap();
    assert!(out_a.contains(ENDPOINT_A), "{ENDPOINT_A} missing in veil-a: {out_a}");

    let out_b = netns_exec(NS_B, &["ip", "-4", "addr", "show", VETH_B]).unwrap();
    assert!(out_b.contains(ENDPOINT_B), "{ENDPOINT_B} missing in veil-b: {out_b}");
}

#[test]
fn test_ping_b_to_a() {
    if !netns_available() {
        eprintln!("SKIP: netns not available");
        return;
    }

    let result = netns_exec(NS_B, &["ping", "-c", "2", "-W", "2", ENDPOINT_A]);
    match &result {
        Ok(out) => println!("{out}"),
        Err(e) => panic!("ping from veil-b to veil-a failed: {e}"),
    }
}

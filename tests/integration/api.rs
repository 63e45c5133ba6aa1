//! Control API and veil-ctl against a running agent.

use crate::*;

#[test]
fn test_status_reports_tunnels() {
    if !ready() {
        return;
    }
    let _lock = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let dir = NodeDir::new("status").unwrap();
    dir.write_hosts(&three_hosts()).unwrap();
    let node = spawn_veild(NS_A, &dir, &[]).unwrap();

    let result = (|| -> Result<()> {
        wait_for_api(NS_A, 20)?;

        let status = api_get(NS_A, "/v1/status")?;
        assert_eq!(status["revision"], 1, "status: {status}");
        assert_eq!(status["local"], "a");
        assert_eq!(status["remotes"], 2);
        assert_eq!(status["daemon_healthy"], true);
        assert_eq!(status["tunnels"], serde_json::json!(["b", "c"]));
        assert_eq!(status["last_reconcile"]["ok"], true);

        // One rendered connection per remote peer.
        let conf_d = dir.path("ipsec").join("conf.d");
        assert!(conf_d.join("veil-b.conf").exists());
        assert!(conf_d.join("veil-c.conf").exists());
        assert!(!conf_d.join("veil-a.conf").exists());

        let peers = api_get(NS_A, "/v1/peers")?;
        assert_eq!(peers["peers"].as_array().map(Vec::len), Some(3));

        let out = ctl(NS_A, &["status"])?;
        assert!(out.contains("veil Agent Status"), "status header missing: {out}");
        assert!(out.contains("Tunnels applied   : 2"), "tunnel count missing: {out}");
        Ok(())
    })();

    if result.is_err() {
        dump_log(&dir);
    }
    stop(node);
    result.unwrap();
}

#[test]
fn test_reload_removes_departed_peer() {
    if !ready() {
        return;
    }
    let _lock = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let dir = NodeDir::new("reload").unwrap();
    dir.write_hosts(&three_hosts()).unwrap();
    let node = spawn_veild(NS_A, &dir, &[]).unwrap();

    let result = (|| -> Result<()> {
        wait_for_api(NS_A, 20)?;

        dir.write_hosts(&serde_json::json!([
            { "id": "a", "endpoint": ENDPOINT_A, "self": true, "overlay_addresses": ["10.0.1.0/24"] },
            { "id": "b", "endpoint": ENDPOINT_B, "overlay_addresses": ["10.0.2.0/24"] }
        ]))?;

        let out = ctl(NS_A, &["reload"])?;
        assert!(out.contains("- c"), "removal missing from reload output: {out}");
        assert!(!dir.path("ipsec").join("conf.d").join("veil-c.conf").exists());

        // Nothing left to do on a second reload.
        let again = api_post(NS_A, "/v1/reload")?;
        assert_eq!(again["changed"], false);
        assert_eq!(again["installed"], serde_json::json!([]));
        assert_eq!(again["removed"], serde_json::json!([]));
        Ok(())
    })();

    if result.is_err() {
        dump_log(&dir);
    }
    stop(node);
    result.unwrap();
}

#[test]
fn test_overlapping_record_is_reported() {
    if !ready() {
        return;
    }
    let _lock = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    let dir = NodeDir::new("overlap").unwrap();
    dir.write_hosts(&serde_json::json!([
        { "id": "a", "endpoint": ENDPOINT_A, "self": true, "overlay_addresses": ["10.0.1.0/24"] },
        { "id": "b", "endpoint": ENDPOINT_B, "overlay_addresses": ["10.0.2.0/24"] },
        { "id": "z", "endpoint": "172.16.0.9", "overlay_addresses": ["10.0.2.128/25"] }
    ]))
    .unwrap();
    let node = spawn_veild(NS_A, &dir, &[]).unwrap();

    let result = (|| -> Result<()> {
        wait_for_api(NS_A, 20)?;

        let status = api_get(NS_A, "/v1/status")?;
        let warnings = status["warnings"].as_array().context("no warnings array")?;
        assert_eq!(warnings.len(), 1, "status: {status}");
        assert_eq!(warnings[0]["id"], "z");
        assert_eq!(status["tunnels"], serde_json::json!(["b"]));
        Ok(())
    })();

    if result.is_err() {
        dump_log(&dir);
    }
    stop(node);
    result.unwrap();
}

#[test]
fn test_missing_host_file_is_fatal() {
    if !ready() {
        return;
    }
    let _lock = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    // wait_for_file_secs = 5 in the generated config.
    let dir = NodeDir::new("nofile").unwrap();
    let mut node = spawn_veild(NS_A, &dir, &[]).unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    let status = loop {
        if let Some(status) = node.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            stop(node);
            panic!("veild kept running without a host file");
        }
        std::thread::sleep(Duration::from_millis(200));
    };
    assert!(!status.success());
}

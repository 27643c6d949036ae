// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Adapter URL parser tests.

use simbricks::parser::parse_url;

#[test]
fn listen_url_with_all_options() {
    let p = parse_url("listen:/a:/b:sync=true:latency=100:sync_interval=42").expect("parse");
    assert!(p.listen);
    assert_eq!(p.socket_path, "/a");
    assert_eq!(p.shm_path.as_deref(), Some("/b"));
    assert!(p.sync);
    assert_eq!(p.link_latency, Some(100));
    assert_eq!(p.sync_interval, Some(42));
}

#[test]
fn connect_url_minimal() {
    let p = parse_url("connect:/a:sync=false").expect("parse");
    assert!(!p.listen);
    assert_eq!(p.socket_path, "/a");
    assert_eq!(p.shm_path, None);
    assert!(!p.sync);
    assert_eq!(p.link_latency, None);
    assert_eq!(p.sync_interval, None);
}

#[test]
fn connect_url_with_sync() {
    let p = parse_url("connect:/tmp/pci0:sync=true:sync_interval=500").expect("parse");
    assert!(!p.listen);
    assert!(p.sync);
    assert_eq!(p.sync_interval, Some(500));
    assert_eq!(p.link_latency, None);
}

#[test]
fn option_order_does_not_matter() {
    let a = parse_url("listen:/s:/m:sync=true:latency=7:sync_interval=9").expect("parse");
    let b = parse_url("listen:/s:/m:sync=true:sync_interval=9:latency=7").expect("parse");
    assert_eq!(a, b);
}

#[test]
fn rejects_bad_role() {
    assert!(parse_url("bind:/a:sync=true").is_err());
    assert!(parse_url(":/a:sync=true").is_err());
    assert!(parse_url("").is_err());
}

#[test]
fn rejects_missing_fields() {
    // No socket path.
    assert!(parse_url("connect").is_err());
    assert!(parse_url("connect:").is_err());
    // Listener without an shm path.
    assert!(parse_url("listen:/a:sync=true").is_err());
    // Missing or malformed sync.
    assert!(parse_url("connect:/a").is_err());
    assert!(parse_url("connect:/a:sync=maybe").is_err());
    assert!(parse_url("connect:/a:async=true").is_err());
}

#[test]
fn rejects_bad_options() {
    assert!(parse_url("connect:/a:sync=true:latency").is_err());
    assert!(parse_url("connect:/a:sync=true:latency=").is_err());
    assert!(parse_url("connect:/a:sync=true:latency=abc").is_err());
    assert!(parse_url("connect:/a:sync=true:bogus=1").is_err());
}

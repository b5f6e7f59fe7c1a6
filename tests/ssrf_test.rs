//! SSRF guard integration tests.
//!
//! Unit tests live in `src/net/mod.rs`; this file adds obfuscation and
//! notation bypass attempts against the public API.

use clawdbot::net::{assert_public_hostname_syntactic, is_private_ip, SsrfError};

// ============== Hostname variants ==============

#[test]
fn test_blocks_localhost_case_and_trailing_dot() {
    assert!(assert_public_hostname_syntactic("LocalHost").is_err());
    assert!(assert_public_hostname_syntactic("localhost.").is_err());
    assert!(assert_public_hostname_syntactic("LOCALHOST.").is_err());
}

#[test]
fn test_blocks_localhost_subdomains() {
    assert!(assert_public_hostname_syntactic("anything.localhost").is_err());
    assert!(assert_public_hostname_syntactic("deep.nested.localhost").is_err());
}

#[test]
fn test_blocks_mdns_and_internal_suffixes() {
    assert!(assert_public_hostname_syntactic("printer.local").is_err());
    assert!(assert_public_hostname_syntactic("service.internal").is_err());
    assert!(assert_public_hostname_syntactic("db.prod.internal").is_err());
}

#[test]
fn test_blocks_cloud_metadata() {
    assert!(assert_public_hostname_syntactic("metadata.google.internal").is_err());
    assert!(assert_public_hostname_syntactic("169.254.169.254").is_err());
}

#[test]
fn test_allows_lookalike_public_names() {
    // Names that merely contain the blocked words are fine.
    assert!(assert_public_hostname_syntactic("localhost.example.com").is_ok());
    assert!(assert_public_hostname_syntactic("internal.example.com").is_ok());
    assert!(assert_public_hostname_syntactic("local.example.com").is_ok());
}

// ============== IPv4 ranges ==============

#[test]
fn test_blocks_every_private_ipv4_range() {
    for host in [
        "0.0.0.0",
        "0.255.255.255",
        "10.0.0.0",
        "10.255.255.255",
        "127.0.0.1",
        "127.0.0.53",
        "169.254.0.1",
        "172.16.0.0",
        "172.31.255.255",
        "192.168.0.0",
        "192.168.255.255",
        "100.64.0.0",
        "100.127.255.255",
    ] {
        assert!(
            assert_public_hostname_syntactic(host).is_err(),
            "{host} should be blocked"
        );
    }
}

#[test]
fn test_allows_adjacent_public_ipv4() {
    // One step outside each blocked range.
    for host in ["1.0.0.0", "11.0.0.0", "172.15.0.1", "172.32.0.1", "192.169.0.1", "100.63.0.1", "100.128.0.1", "169.253.0.1"] {
        assert!(
            assert_public_hostname_syntactic(host).is_ok(),
            "{host} should be allowed"
        );
    }
}

// ============== IPv6 ==============

#[test]
fn test_blocks_ipv6_special_and_private() {
    for host in ["::", "::1", "fc00::1", "fdff::1", "fe80::1", "febf::1", "fec0::1"] {
        assert!(
            assert_public_hostname_syntactic(host).is_err(),
            "{host} should be blocked"
        );
    }
}

#[test]
fn test_bracketed_ipv6_is_unwrapped() {
    assert!(assert_public_hostname_syntactic("[::1]").is_err());
    assert!(assert_public_hostname_syntactic("[fe80::1]").is_err());
    assert!(assert_public_hostname_syntactic("[2606:4700:4700::1111]").is_ok());
}

#[test]
fn test_ipv4_mapped_ipv6_rechecked_as_ipv4() {
    assert!(assert_public_hostname_syntactic("::ffff:127.0.0.1").is_err());
    assert!(assert_public_hostname_syntactic("::ffff:192.168.1.1").is_err());
    assert!(assert_public_hostname_syntactic("::ffff:10.0.0.1").is_err());
    assert!(assert_public_hostname_syntactic("::ffff:169.254.169.254").is_err());
    assert!(assert_public_hostname_syntactic("::ffff:8.8.8.8").is_ok());
}

// ============== Error surfaces ==============

#[test]
fn test_error_variants_carry_context() {
    match assert_public_hostname_syntactic("localhost") {
        Err(SsrfError::BlockedHostname(host)) => assert_eq!(host, "localhost"),
        other => panic!("unexpected: {other:?}"),
    }
    match assert_public_hostname_syntactic("10.1.2.3") {
        Err(SsrfError::PrivateAddress { host, addr }) => {
            assert_eq!(host, "10.1.2.3");
            assert!(is_private_ip(&addr));
        }
        other => panic!("unexpected: {other:?}"),
    }
}

// ============== DNS path ==============

#[tokio::test]
async fn test_resolution_failure_is_reported() {
    // An invalid TLD never resolves; the guard reports resolution failure
    // rather than permitting the dial.
    let result =
        clawdbot::net::assert_public_hostname("this-host-does-not-exist.invalid").await;
    assert!(matches!(result, Err(SsrfError::Resolution { .. })));
}

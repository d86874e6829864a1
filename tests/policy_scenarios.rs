mod common;

use common::test_core;
use dnsgate::Decision;
use dnsgate::config::{DomainOverride, OverrideList, OverrideType};
use dnsgate::index::{DomainIndex, DomainRecord};
use dnsgate::ingest::parse_line;

/// Parse a literal hostfile body into a staging index and promote it, the
/// same path a real refresh takes.
async fn load_list(core: &dnsgate::Core, body: &str, list_id: i64) {
    let staging = DomainIndex::open_staging(&core.paths().db_path()).unwrap();
    let batch: Vec<_> = body
        .lines()
        .filter_map(parse_line)
        .map(|domain| (domain, DomainRecord::for_list(list_id)))
        .collect();
    staging.bulk_put(&batch).unwrap();
    staging.flush().unwrap();
    drop(staging);
    core.transfer_staging().await.unwrap();
}

const COUNTER_LIST: &str = "127.0.0.1\t005.free-counter.co.uk\n008.free-counter.co.uk\ncom\n";

#[tokio::test]
async fn test_hostfile_list_suffix_blocking() {
    let (_dir, core, _bus) = test_core(false);
    load_list(&core, COUNTER_LIST, 0).await;

    assert!(!core.blocked("1.2.3.4", "example.org.").is_blocked());
    assert!(core.blocked("1.2.3.4", "com.").is_blocked());
    assert!(core.blocked("1.2.3.4", "005.free-counter.co.uk.").is_blocked());
    assert!(
        core.blocked("1.2.3.4", "www.005.free-counter.co.uk.")
            .is_blocked()
    );
    assert!(core.blocked("1.2.3.4", "008.free-counter.co.uk.").is_blocked());
    assert!(
        core.blocked("1.2.3.4", "www.008.free-counter.co.uk.")
            .is_blocked()
    );
}

#[tokio::test]
async fn test_permit_overrides_beat_blocklist() {
    let (_dir, core, _bus) = test_core(true);
    load_list(&core, COUNTER_LIST, 0).await;

    let permit = |domain: &str, client_ip: &str, ip: &str, cname: &str| DomainOverride {
        r#type: OverrideType::Permit,
        domain: domain.to_string(),
        result_ip: ip.to_string(),
        result_cname: cname.to_string(),
        client_ip: client_ip.to_string(),
        expiration: 0,
        tags: vec![],
    };
    core.config_mut().override_lists = vec![OverrideList {
        name: "Default".to_string(),
        enabled: true,
        tags: vec![],
        permit_domains: vec![
            permit("override.com.", "*", "", ""),
            permit("ip.permit.com.", "", "1.1.1.1", ""),
            permit("cname.permit.com.", "", "", "safesearch.permit.com"),
        ],
        block_domains: vec![],
    }];

    // override.com is under the blocked `com.` suffix, the permit wins
    match core.blocked("1.2.3.4", "override.com.") {
        Decision::Allow(allowance) => assert!(allowance.has_permit),
        other => panic!("expected allow, got {other:?}"),
    }

    match core.blocked("1.2.3.4", "ip.permit.com.") {
        Decision::Allow(allowance) => {
            assert_eq!(allowance.return_ip.as_deref(), Some("1.1.1.1"));
        }
        other => panic!("expected allow, got {other:?}"),
    }

    match core.blocked("1.2.3.4", "cname.permit.com.") {
        Decision::Allow(allowance) => {
            assert_eq!(
                allowance.return_cname.as_deref(),
                Some("safesearch.permit.com")
            );
        }
        other => panic!("expected allow, got {other:?}"),
    }
}

#[tokio::test]
async fn test_reparsing_same_list_is_idempotent() {
    let (_dir, core, _bus) = test_core(false);

    load_list(&core, COUNTER_LIST, 0).await;
    let mut first = core.index_keys().unwrap();
    first.sort();
    let first_count = core.index_count();

    load_list(&core, COUNTER_LIST, 0).await;
    let mut second = core.index_keys().unwrap();
    second.sort();

    assert_eq!(first, second);
    assert_eq!(core.index_count(), first_count);
    // fresh staging each round, so list ids do not accumulate
    assert_eq!(core.index_get("com.").unwrap().list_ids, vec![0]);
    assert!(core.blocked("1.2.3.4", "com.").is_blocked());
}

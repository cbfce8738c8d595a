//! Consolidated export.
//!
//! Streams every stored artifact through the parser and folds the results
//! into one report keyed by address. Records that failed to parse are
//! dropped from the export; they remain inspectable through the per-host
//! read path.

use std::collections::BTreeMap;
use std::io;

use serde::{Deserialize, Serialize};

use crate::artifacts::ArtifactStore;
use crate::nmap::parser::{HostRecord, parse_host_xml};

/// The consolidated scan report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    /// Earliest chunk creation stamp, when any chunk exists.
    pub scan_started: Option<u64>,
    /// Latest chunk completion stamp, when any chunk finished.
    pub scan_finished: Option<u64>,
    pub hosts: BTreeMap<String, HostRecord>,
}

pub(crate) async fn consolidate(
    store: &ArtifactStore,
    scan_started: Option<u64>,
    scan_finished: Option<u64>,
) -> io::Result<ScanReport> {
    let mut hosts = BTreeMap::new();
    let mut skipped = 0usize;
    for entry in store.iterate().await? {
        let record = parse_host_xml(&entry.bytes);
        if record.is_error() {
            skipped += 1;
            continue;
        }
        hosts.insert(entry.address, record);
    }
    if skipped > 0 {
        tracing::debug!(skipped, "export dropped unparsable artifacts");
    }
    Ok(ScanReport {
        scan_started,
        scan_finished,
        hosts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmap::parser::HostState;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn host_xml(address: &str) -> String {
        format!(
            "<nmaprun><host><status state=\"up\" reason=\"syn-ack\"/>\
             <address addr=\"{address}\" addrtype=\"ipv4\"/></host>\
             <runstats><finished summary=\"1 host up\"/></runstats></nmaprun>"
        )
    }

    #[tokio::test]
    async fn consolidates_artifacts_and_drops_parse_errors() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let chunk = Uuid::new_v4();

        store
            .write(chunk, "10.0.0.1", host_xml("10.0.0.1").as_bytes())
            .await
            .unwrap();
        store.write(chunk, "10.0.0.2", b"").await.unwrap();
        store.write(chunk, "10.0.0.3", b"<not/xml").await.unwrap();

        let report = consolidate(&store, Some(1), Some(2)).await.unwrap();
        assert_eq!(report.scan_started, Some(1));
        assert_eq!(report.scan_finished, Some(2));
        assert_eq!(report.hosts.len(), 2);
        assert_eq!(report.hosts["10.0.0.1"].status.state, HostState::Up);
        // The empty artifact is a legitimate "never answered" outcome.
        assert_eq!(report.hosts["10.0.0.2"].status.state, HostState::Down);
        assert!(!report.hosts.contains_key("10.0.0.3"));
    }

    #[tokio::test]
    async fn empty_store_exports_an_empty_report() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let report = consolidate(&store, None, None).await.unwrap();
        assert!(report.hosts.is_empty());
        assert_eq!(report.scan_started, None);
    }
}
